//! Area restrictors
//!
//! `qserv_areaspec_*` calls in the WHERE clause restrict a query to a sky
//! region. Each one is used twice: as a [`Region`] that prunes the chunk
//! set before dispatch, and as a rewritten `scisql_s2PtIn*` predicate the
//! worker evaluates against the director's longitude/latitude columns.

use skyshard_catalog::Region;

use crate::analysis::ast::RestrictorCall;
use crate::error::{CzarError, CzarResult};

/// A recognized area restrictor with validated arity.
#[derive(Debug, Clone, PartialEq)]
pub enum AreaRestrictor {
    Box {
        lon_min: String,
        lat_min: String,
        lon_max: String,
        lat_max: String,
    },
    Circle {
        lon: String,
        lat: String,
        radius: String,
    },
    Ellipse {
        lon: String,
        lat: String,
        semi_major: String,
        semi_minor: String,
        angle: String,
    },
    Poly {
        /// Flat lon/lat pairs, validated even and non-empty.
        coords: Vec<String>,
    },
}

impl AreaRestrictor {
    /// Validate one call. Unknown `qserv_areaspec_` suffixes and wrong
    /// argument counts are plan errors.
    pub fn from_call(call: &RestrictorCall) -> CzarResult<Self> {
        let args = &call.args;
        match call.name.as_str() {
            "qserv_areaspec_box" => match args.as_slice() {
                [lon_min, lat_min, lon_max, lat_max] => Ok(Self::Box {
                    lon_min: lon_min.clone(),
                    lat_min: lat_min.clone(),
                    lon_max: lon_max.clone(),
                    lat_max: lat_max.clone(),
                }),
                _ => Err(arity_error(&call.name, 4, args.len())),
            },
            "qserv_areaspec_circle" => match args.as_slice() {
                [lon, lat, radius] => Ok(Self::Circle {
                    lon: lon.clone(),
                    lat: lat.clone(),
                    radius: radius.clone(),
                }),
                _ => Err(arity_error(&call.name, 3, args.len())),
            },
            "qserv_areaspec_ellipse" => match args.as_slice() {
                [lon, lat, semi_major, semi_minor, angle] => Ok(Self::Ellipse {
                    lon: lon.clone(),
                    lat: lat.clone(),
                    semi_major: semi_major.clone(),
                    semi_minor: semi_minor.clone(),
                    angle: angle.clone(),
                }),
                _ => Err(arity_error(&call.name, 5, args.len())),
            },
            "qserv_areaspec_poly" => {
                if args.len() < 6 || args.len() % 2 != 0 {
                    return Err(CzarError::Plan(format!(
                        "{} requires an even number of at least 6 parameters, got {}",
                        call.name,
                        args.len()
                    )));
                }
                Ok(Self::Poly {
                    coords: args.clone(),
                })
            }
            other => Err(CzarError::Plan(format!(
                "unknown area restrictor: {other}"
            ))),
        }
    }

    /// The pruning region. Non-numeric arguments are plan errors.
    pub fn region(&self) -> CzarResult<Region> {
        let num = |s: &String| -> CzarResult<f64> {
            s.parse::<f64>().map_err(|_| {
                CzarError::Plan(format!("area restrictor parameter is not numeric: {s}"))
            })
        };
        match self {
            Self::Box {
                lon_min,
                lat_min,
                lon_max,
                lat_max,
            } => Ok(Region::Box {
                lon_min: num(lon_min)?,
                lat_min: num(lat_min)?,
                lon_max: num(lon_max)?,
                lat_max: num(lat_max)?,
            }),
            Self::Circle { lon, lat, radius } => Ok(Region::Circle {
                lon: num(lon)?,
                lat: num(lat)?,
                radius: num(radius)?,
            }),
            Self::Ellipse {
                lon,
                lat,
                semi_major,
                semi_minor,
                angle,
            } => Ok(Region::Ellipse {
                lon: num(lon)?,
                lat: num(lat)?,
                semi_major_arcsec: num(semi_major)?,
                semi_minor_arcsec: num(semi_minor)?,
                position_angle: num(angle)?,
            }),
            Self::Poly { coords } => {
                let mut vertices = Vec::with_capacity(coords.len() / 2);
                for pair in coords.chunks(2) {
                    if let [lon, lat] = pair {
                        vertices.push((num(lon)?, num(lat)?));
                    }
                }
                Ok(Region::Poly { vertices })
            }
        }
    }

    /// Worker-side predicate over the director's position columns.
    /// `qualifier` is the table alias prefix, empty for unaliased tables.
    pub fn scisql_predicate(&self, qualifier: &str, lon_col: &str, lat_col: &str) -> String {
        let prefix = if qualifier.is_empty() {
            String::new()
        } else {
            format!("{qualifier}.")
        };
        let point = format!("{prefix}{lon_col},{prefix}{lat_col}");
        match self {
            Self::Box {
                lon_min,
                lat_min,
                lon_max,
                lat_max,
            } => format!("scisql_s2PtInBox({point},{lon_min},{lat_min},{lon_max},{lat_max})=1"),
            Self::Circle { lon, lat, radius } => {
                format!("scisql_s2PtInCircle({point},{lon},{lat},{radius})=1")
            }
            Self::Ellipse {
                lon,
                lat,
                semi_major,
                semi_minor,
                angle,
            } => format!(
                "scisql_s2PtInEllipse({point},{lon},{lat},{semi_major},{semi_minor},{angle})=1"
            ),
            Self::Poly { coords } => {
                format!("scisql_s2PtInCPoly({point},{})=1", coords.join(","))
            }
        }
    }
}

fn arity_error(name: &str, expected: usize, got: usize) -> CzarError {
    CzarError::Plan(format!("{name} requires {expected} parameters, got {got}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[&str]) -> RestrictorCall {
        RestrictorCall {
            name: name.to_string(),
            args: args.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn box_restrictor_renders_scisql_predicate() {
        let r = AreaRestrictor::from_call(&call("qserv_areaspec_box", &["0", "0", "1", "1"]))
            .expect("valid box");
        assert_eq!(
            r.scisql_predicate("", "ra", "decl"),
            "scisql_s2PtInBox(ra,decl,0,0,1,1)=1"
        );
        assert_eq!(
            r.scisql_predicate("o", "ra", "decl"),
            "scisql_s2PtInBox(o.ra,o.decl,0,0,1,1)=1"
        );
    }

    #[test]
    fn wrong_arity_is_a_plan_error() {
        let err =
            AreaRestrictor::from_call(&call("qserv_areaspec_box", &["0", "0", "1"])).unwrap_err();
        assert!(matches!(err, CzarError::Plan(_)));
        let err =
            AreaRestrictor::from_call(&call("qserv_areaspec_circle", &["0"])).unwrap_err();
        assert!(matches!(err, CzarError::Plan(_)));
        let err = AreaRestrictor::from_call(&call("qserv_areaspec_poly", &["0", "0", "1", "1"]))
            .unwrap_err();
        assert!(matches!(err, CzarError::Plan(_)));
    }

    #[test]
    fn unknown_restrictor_is_a_plan_error() {
        let err = AreaRestrictor::from_call(&call("qserv_areaspec_blob", &["1"])).unwrap_err();
        assert!(matches!(err, CzarError::Plan(_)));
    }

    #[test]
    fn regions_parse_numeric_arguments() {
        let r = AreaRestrictor::from_call(&call("qserv_areaspec_circle", &["10", "-5", "0.5"]))
            .expect("valid circle");
        match r.region().expect("region") {
            Region::Circle { lon, lat, radius } => {
                assert_eq!(lon, 10.0);
                assert_eq!(lat, -5.0);
                assert_eq!(radius, 0.5);
            }
            other => panic!("wrong region: {other:?}"),
        }
    }
}
