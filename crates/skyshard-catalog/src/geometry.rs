//! Spherical-box partitioning geometry
//!
//! The sky is divided into latitude stripes of equal height; each stripe is
//! divided into chunks whose longitude width roughly compensates for the
//! stripe's distance from the equator. Chunk ids are `stripe * stride +
//! position`, with a stride of `2 * num_stripes` (the widest stripe at the
//! equator needs at most that many chunks).
//!
//! Region pruning is conservative: a chunk is kept whenever its bounding box
//! intersects the region's bounding box, so pruning may keep extra chunks
//! but never drops one that holds matching rows.

use serde::{Deserialize, Serialize};
use skyshard_common::{ChunkId, SubchunkId};

/// An axis-aligned box on the sphere, in degrees. Longitudes live in
/// `[0, 360)`; a box with `lon_min > lon_max` wraps through zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SphericalBox {
    pub lon_min: f64,
    pub lat_min: f64,
    pub lon_max: f64,
    pub lat_max: f64,
}

impl SphericalBox {
    pub fn new(lon_min: f64, lat_min: f64, lon_max: f64, lat_max: f64) -> Self {
        Self {
            lon_min: normalize_lon(lon_min),
            lat_min: lat_min.clamp(-90.0, 90.0),
            lon_max: normalize_lon(lon_max),
            lat_max: lat_max.clamp(-90.0, 90.0),
        }
    }

    /// Full-sky box, the identity element for intersection tests.
    pub fn full_sky() -> Self {
        Self {
            lon_min: 0.0,
            lat_min: -90.0,
            lon_max: 360.0,
            lat_max: 90.0,
        }
    }

    pub fn intersects(&self, other: &Self) -> bool {
        if self.lat_min > other.lat_max || other.lat_min > self.lat_max {
            return false;
        }
        lon_ranges_overlap(self.lon_min, self.lon_max, other.lon_min, other.lon_max)
    }
}

fn normalize_lon(lon: f64) -> f64 {
    if (0.0..=360.0).contains(&lon) {
        lon
    } else {
        lon.rem_euclid(360.0)
    }
}

/// Overlap test for longitude intervals on a circle. An interval with
/// `min > max` wraps through zero and is split into two plain intervals.
fn lon_ranges_overlap(a_min: f64, a_max: f64, b_min: f64, b_max: f64) -> bool {
    let split = |min: f64, max: f64| -> Vec<(f64, f64)> {
        if min <= max {
            vec![(min, max)]
        } else {
            vec![(min, 360.0), (0.0, max)]
        }
    };
    for (amin, amax) in split(a_min, a_max) {
        for (bmin, bmax) in split(b_min, b_max) {
            if amin <= bmax && bmin <= amax {
                return true;
            }
        }
    }
    false
}

/// A sky region recognized by the area restrictors. Parameters are carried
/// in degrees except the ellipse axes, which arrive in arcseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Region {
    Box {
        lon_min: f64,
        lat_min: f64,
        lon_max: f64,
        lat_max: f64,
    },
    Circle {
        lon: f64,
        lat: f64,
        radius: f64,
    },
    Ellipse {
        lon: f64,
        lat: f64,
        semi_major_arcsec: f64,
        semi_minor_arcsec: f64,
        position_angle: f64,
    },
    Poly {
        /// `(lon, lat)` vertex pairs.
        vertices: Vec<(f64, f64)>,
    },
}

impl Region {
    /// Conservative bounding box used for chunk pruning.
    pub fn bounding_box(&self) -> SphericalBox {
        match self {
            Self::Box {
                lon_min,
                lat_min,
                lon_max,
                lat_max,
            } => SphericalBox::new(*lon_min, *lat_min, *lon_max, *lat_max),
            Self::Circle { lon, lat, radius } => cone_bounds(*lon, *lat, *radius),
            Self::Ellipse {
                lon,
                lat,
                semi_major_arcsec,
                ..
            } => cone_bounds(*lon, *lat, semi_major_arcsec / 3600.0),
            Self::Poly { vertices } => {
                if vertices.is_empty() {
                    return SphericalBox::full_sky();
                }
                let mut lon_min = f64::MAX;
                let mut lon_max = f64::MIN;
                let mut lat_min = f64::MAX;
                let mut lat_max = f64::MIN;
                for (lon, lat) in vertices {
                    lon_min = lon_min.min(*lon);
                    lon_max = lon_max.max(*lon);
                    lat_min = lat_min.min(*lat);
                    lat_max = lat_max.max(*lat);
                }
                SphericalBox::new(lon_min, lat_min, lon_max, lat_max)
            }
        }
    }
}

fn cone_bounds(lon: f64, lat: f64, radius: f64) -> SphericalBox {
    let lat_min = lat - radius;
    let lat_max = lat + radius;
    // Near a pole the cone spans all longitudes.
    if lat_min <= -89.0 || lat_max >= 89.0 {
        return SphericalBox::new(0.0, lat_min, 360.0, lat_max);
    }
    let cos_lat = lat.to_radians().cos().max(1e-6);
    let lon_radius = (radius / cos_lat).min(180.0);
    SphericalBox::new(lon - lon_radius, lat_min, lon + lon_radius, lat_max)
}

/// Chunk numbering scheme for one partitioning family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkGeometry {
    /// Number of equal-height latitude stripes.
    pub num_stripes: u32,
    /// Subdivision factor per axis inside a chunk.
    pub num_sub_stripes: u32,
}

impl ChunkGeometry {
    pub fn new(num_stripes: u32, num_sub_stripes: u32) -> Self {
        Self {
            num_stripes: num_stripes.max(1),
            num_sub_stripes: num_sub_stripes.max(1),
        }
    }

    fn stride(&self) -> u32 {
        self.num_stripes * 2
    }

    fn stripe_height(&self) -> f64 {
        180.0 / f64::from(self.num_stripes)
    }

    fn chunks_in_stripe(&self, stripe: u32) -> u32 {
        let lat_center = -90.0 + (f64::from(stripe) + 0.5) * self.stripe_height();
        let cos_lat = lat_center.to_radians().cos().max(0.0);
        let n = (f64::from(self.stride()) * cos_lat).ceil() as u32;
        n.clamp(1, self.stride())
    }

    /// Bounding box of a chunk. Out-of-range positions are clamped to the
    /// stripe so a stale id still maps to sky rather than panicking.
    pub fn chunk_bounds(&self, chunk: ChunkId) -> SphericalBox {
        let stripe = (chunk.0 / self.stride()).min(self.num_stripes - 1);
        let n = self.chunks_in_stripe(stripe);
        let position = (chunk.0 % self.stride()).min(n - 1);
        let lat_min = -90.0 + f64::from(stripe) * self.stripe_height();
        let width = 360.0 / f64::from(n);
        SphericalBox::new(
            f64::from(position) * width,
            lat_min,
            (f64::from(position) + 1.0) * width,
            lat_min + self.stripe_height(),
        )
    }

    /// All chunk ids this geometry can produce, in increasing order.
    pub fn all_chunks(&self) -> Vec<ChunkId> {
        let mut out = Vec::new();
        for stripe in 0..self.num_stripes {
            for position in 0..self.chunks_in_stripe(stripe) {
                out.push(ChunkId(stripe * self.stride() + position));
            }
        }
        out
    }

    /// Subchunk ids within one chunk, in increasing order.
    pub fn subchunks(&self) -> Vec<SubchunkId> {
        (0..self.num_sub_stripes * self.num_sub_stripes)
            .map(SubchunkId)
            .collect()
    }

    pub fn intersects(&self, chunk: ChunkId, region: &Region) -> bool {
        self.chunk_bounds(chunk).intersects(&region.bounding_box())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids_increase_with_latitude_stripe() {
        let geom = ChunkGeometry::new(6, 3);
        let chunks = geom.all_chunks();
        let mut sorted = chunks.clone();
        sorted.sort();
        assert_eq!(chunks, sorted);
        // Polar stripes hold fewer chunks than the equatorial ones.
        let equator_stripe = 3;
        assert!(geom.chunks_in_stripe(0) < geom.chunks_in_stripe(equator_stripe));
    }

    #[test]
    fn box_region_prunes_far_chunks() {
        let geom = ChunkGeometry::new(6, 3);
        let near_origin = Region::Box {
            lon_min: 0.0,
            lat_min: 0.0,
            lon_max: 1.0,
            lat_max: 1.0,
        };
        let kept: Vec<_> = geom
            .all_chunks()
            .into_iter()
            .filter(|c| geom.intersects(*c, &near_origin))
            .collect();
        assert!(!kept.is_empty());
        assert!(kept.len() < geom.all_chunks().len());
    }

    #[test]
    fn wrapping_longitude_interval_overlaps_both_sides() {
        let wrapping = SphericalBox::new(350.0, -10.0, 10.0, 10.0);
        let east = SphericalBox::new(355.0, -5.0, 358.0, 5.0);
        let west = SphericalBox::new(2.0, -5.0, 5.0, 5.0);
        let far = SphericalBox::new(100.0, -5.0, 120.0, 5.0);
        assert!(wrapping.intersects(&east));
        assert!(wrapping.intersects(&west));
        assert!(!wrapping.intersects(&far));
    }

    #[test]
    fn polar_circle_spans_all_longitudes() {
        let region = Region::Circle {
            lon: 10.0,
            lat: 89.5,
            radius: 1.0,
        };
        let bounds = region.bounding_box();
        assert_eq!(bounds.lon_min, 0.0);
        assert_eq!(bounds.lon_max, 360.0);
    }

    #[test]
    fn subchunk_count_is_square_of_substripes() {
        let geom = ChunkGeometry::new(6, 3);
        assert_eq!(geom.subchunks().len(), 9);
    }
}
