//! Task intake
//!
//! Validates incoming task messages, enforces the one-active-task rule per
//! `(query, job)`, builds the executable task and hands it to the scheduler.
//! Admin commands are handled here too, outside the schedulers.

use serde_json::json;
use skyshard_common::JobId;
use skyshard_proto::{
    CancelMsg, ErrorMsg, Message, StatusMsg, TaskMsg, TaskState, WireErrorCode, WorkerCommand,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::send_channel::{Outbound, SendChannel, try_send_control};
use crate::service::{Registration, ServiceContext};
use crate::task::{Task, TaskKey};

/// Per-connection intake of czar messages.
pub struct WorkerDispatcher {
    ctx: Arc<ServiceContext>,
}

impl WorkerDispatcher {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    /// Route one inbound message. Replies go to the connection's writer
    /// queue.
    pub async fn handle(&self, message: Message, out: &mpsc::Sender<Outbound>) {
        match message {
            Message::Task(task) => self.handle_task(task, out).await,
            Message::Cancel(cancel) => self.handle_cancel(cancel),
            Message::WorkerCommand(command) => self.handle_command(command, out),
            other => {
                warn!(tag = other.tag(), "unexpected message on worker channel");
            }
        }
    }

    async fn handle_task(&self, msg: TaskMsg, out: &mpsc::Sender<Outbound>) {
        debug!(
            query_id = %msg.query_id,
            job_id = %msg.job_id,
            attempt = msg.attempt,
            chunk = msg.chunk.0,
            "task message received"
        );

        if let Err(err) = self.ctx.check_ownership(&msg.db, msg.chunk) {
            warn!(error = %err, "rejecting task for foreign chunk");
            try_send_control(
                out,
                Message::Error(ErrorMsg {
                    query_id: msg.query_id,
                    job_id: msg.job_id,
                    code: WireErrorCode::ResourceMismatch,
                    text: err.to_string(),
                }),
            );
            return;
        }

        let channel = Arc::new(SendChannel::new(
            msg.query_id,
            msg.job_id,
            msg.attempt,
            out.clone(),
            Arc::clone(&self.ctx.budget),
        ));
        let task = Arc::new(Task::new(&msg, channel));

        match self.ctx.register_task(&task) {
            Registration::Accepted => {}
            Registration::Duplicate => {
                try_send_control(
                    out,
                    Message::Error(ErrorMsg {
                        query_id: msg.query_id,
                        job_id: msg.job_id,
                        code: WireErrorCode::DuplicateTask,
                        text: format!("task {} already active at this attempt", task.key()),
                    }),
                );
                return;
            }
            Registration::PreviousAttemptCancelled => {
                try_send_control(
                    out,
                    Message::Error(ErrorMsg {
                        query_id: msg.query_id,
                        job_id: msg.job_id,
                        code: WireErrorCode::ServerInProgress,
                        text: "previous attempt still draining; retry".to_string(),
                    }),
                );
                return;
            }
        }

        try_send_control(
            out,
            Message::Status(StatusMsg {
                query_id: msg.query_id,
                job_id: msg.job_id,
                state: TaskState::Queued,
                extended: String::new(),
            }),
        );
        self.ctx.scheduler.enqueue(task);
    }

    fn handle_cancel(&self, msg: CancelMsg) {
        let key = TaskKey {
            query_id: msg.query_id,
            job_id: msg.job_id,
        };
        self.ctx.cancel_task(&key);
    }

    fn handle_command(&self, command: WorkerCommand, out: &mpsc::Sender<Outbound>) {
        let payload = match command {
            WorkerCommand::AddChunk { db, chunk } => {
                self.ctx.add_chunk(&db, chunk);
                json!({ "success": true })
            }
            WorkerCommand::RemoveChunk { db, chunk } => {
                self.ctx.remove_chunk(&db, chunk);
                json!({ "success": true })
            }
            WorkerCommand::ListChunks => {
                let chunks: Vec<_> = self
                    .ctx
                    .list_chunks()
                    .into_iter()
                    .map(|(db, chunk)| json!({ "db": db, "chunk": chunk }))
                    .collect();
                json!({ "success": true, "chunks": chunks })
            }
            WorkerCommand::Echo { payload } => {
                info!(payload, "echo command");
                json!({ "success": true, "echo": payload })
            }
        };
        try_send_control(
            out,
            Message::Status(StatusMsg {
                query_id: skyshard_common::QueryId(0),
                job_id: JobId(0),
                state: TaskState::Complete,
                extended: payload.to_string(),
            }),
        );
    }
}
