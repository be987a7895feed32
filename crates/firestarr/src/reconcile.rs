//! Fire reconciliation: merge disagreeing feeds, attach perimeters, cluster
//! into named groups.
//!
//! Naming is the load-bearing part: a group is named by the 10 km basemap
//! tile of its centroid in the UTM zone of its fuels raster, so the same
//! ground truth yields the same name in every run and resumed runs find
//! their directories again.

use crate::config::BoundsRegion;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use firestarr_geo::zones::{find_best_raster, ZoneRaster};
use firestarr_geo::{area_ha, area_ha_to_radius_m, circle, project_geometry, project_point, Crs};
use firestarr_sources::types::{FireFeature, FireStatus};
use geo::{BooleanOps, Centroid, EuclideanDistance, Geometry, MultiPolygon, Point, Simplify};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Perimeters further than this from every fire become synthetic fires.
const PERIMETER_JOIN_DISTANCE_M: f64 = 1000.0;
/// Simplification tolerance for inflated circles, in meters.
const SIMPLIFY_TOLERANCE_M: f64 = 100.0;

/// One spatial cluster of fires, simulated as a unit.
#[derive(Debug, Clone)]
pub struct FireGroup {
    /// `<zone><N|S>_<basemap5>`, stable across runs.
    pub name: String,
    pub zone: u8,
    pub north: bool,
    /// WGS84; a polygon set when any member has one, else a point.
    pub geometry: Geometry<f64>,
    pub lat: f64,
    pub lon: f64,
    pub area_ha: f64,
    pub status: FireStatus,
    pub datetime: Option<DateTime<Utc>>,
    /// Bounds region the centroid falls in, for publish ordering.
    pub region_id: String,
    pub priority: u32,
    pub duration_days: u32,
    /// Source fire ids folded into this group.
    pub members: Vec<String>,
}

pub struct Reconciler<'a> {
    pub group_distance_km: f64,
    pub unmatched_keep_days: i64,
    pub zones: &'a [ZoneRaster],
    pub now: DateTime<Utc>,
}

impl<'a> Reconciler<'a> {
    /// Merge fire lists (later lists override earlier by id), attach
    /// perimeters, and cluster into named groups.
    pub fn reconcile(
        &self,
        fire_lists: Vec<Vec<FireFeature>>,
        perimeters: Vec<FireFeature>,
    ) -> Result<Vec<FireGroup>> {
        let mut fires = merge_by_guid(fire_lists);
        for fire in fires.iter_mut() {
            inflate_point_fire(fire)?;
        }
        self.attach_perimeters(&mut fires, perimeters)?;
        let fires = dissolve_by_guid(fires)?;
        self.cluster(fires)
    }

    /// Assign every perimeter to the nearest fire within 1 km; the rest
    /// become synthetic fires if recent enough.
    fn attach_perimeters(
        &self,
        fires: &mut Vec<FireFeature>,
        perimeters: Vec<FireFeature>,
    ) -> Result<()> {
        let mut unmatched_count = 0usize;
        for perimeter in perimeters {
            let mut candidates = Vec::new();
            for (index, fire) in fires.iter().enumerate() {
                let d = distance_m(&fire.geometry, &perimeter.geometry)?;
                if d <= PERIMETER_JOIN_DISTANCE_M {
                    candidates.push(index);
                }
            }
            if candidates.is_empty() {
                let age_ok = perimeter
                    .datetime
                    .map(|dt| self.now - dt <= Duration::days(self.unmatched_keep_days))
                    .unwrap_or(false);
                if age_ok {
                    unmatched_count += 1;
                    let guid = format!("UNMATCHED_{unmatched_count}");
                    info!(guid = %guid, "keeping unmatched perimeter as synthetic fire");
                    fires.push(FireFeature {
                        guid,
                        status: FireStatus::Unknown,
                        area_ha: perimeter.area_ha,
                        geometry: perimeter.geometry,
                        datetime: perimeter.datetime,
                    });
                } else {
                    debug!(guid = %perimeter.guid, "dropping stale unmatched perimeter");
                }
                continue;
            }

            // the best-status, largest, lexicographically-last fire wins the
            // perimeter; everyone nearby inherits its status
            let winner = *candidates
                .iter()
                .max_by(|a, b| {
                    let fa = &fires[**a];
                    let fb = &fires[**b];
                    fa.status
                        .rank()
                        .cmp(&fb.status.rank())
                        .then(
                            fa.area_ha
                                .unwrap_or(0.0)
                                .partial_cmp(&fb.area_ha.unwrap_or(0.0))
                                .unwrap_or(std::cmp::Ordering::Equal),
                        )
                        .then(fa.guid.cmp(&fb.guid))
                })
                .expect("candidates is non-empty");
            let status = fires[winner].status;
            for index in &candidates {
                fires[*index].status = status;
            }
            fires[winner].geometry =
                union_geometries(&fires[winner].geometry, &perimeter.geometry)?;
            if let Some(dt) = perimeter.datetime {
                let keep = fires[winner].datetime.map(|d| d.max(dt)).unwrap_or(dt);
                fires[winner].datetime = Some(keep);
            }
        }
        Ok(())
    }

    /// Union-find clustering: fires chain into one group whenever their
    /// geometries are within `group_distance_km`.
    fn cluster(&self, fires: Vec<FireFeature>) -> Result<Vec<FireGroup>> {
        let n = fires.len();
        let mut parent: Vec<usize> = (0..n).collect();
        fn root(parent: &mut Vec<usize>, mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }
        let limit_m = self.group_distance_km * 1000.0;
        for i in 0..n {
            for j in (i + 1)..n {
                if distance_m(&fires[i].geometry, &fires[j].geometry)? <= limit_m {
                    let (ri, rj) = (root(&mut parent, i), root(&mut parent, j));
                    if ri != rj {
                        parent[ri] = rj;
                    }
                }
            }
        }

        let mut clusters: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..n {
            clusters.entry(root(&mut parent, i)).or_default().push(i);
        }

        let mut by_name: HashMap<String, FireGroup> = HashMap::new();
        for members in clusters.into_values() {
            let group = self.build_group(&fires, &members)?;
            match by_name.remove(&group.name) {
                None => {
                    by_name.insert(group.name.clone(), group);
                }
                Some(existing) => {
                    // two clusters in one basemap tile collapse into one
                    warn!(name = %group.name, "merging groups sharing a basemap tile");
                    let merged_members: Vec<usize> = existing
                        .members
                        .iter()
                        .chain(group.members.iter())
                        .map(|guid| {
                            fires
                                .iter()
                                .position(|f| &f.guid == guid)
                                .expect("member came from fires")
                        })
                        .collect();
                    let merged = self.build_group(&fires, &merged_members)?;
                    by_name.insert(merged.name.clone(), merged);
                }
            }
        }

        let mut groups: Vec<FireGroup> = by_name.into_values().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        info!(fires = n, groups = groups.len(), "clustered fires");
        Ok(groups)
    }

    fn build_group(&self, fires: &[FireFeature], members: &[usize]) -> Result<FireGroup> {
        let geometry = combined_geometry(fires, members)?;
        let centroid = geometry
            .centroid()
            .ok_or_else(|| anyhow!("group geometry has no centroid"))?;
        let (lon, lat) = (centroid.x(), centroid.y());
        let (name, zone, north) = name_for(lat, lon, self.zones)?;

        let area = match &geometry {
            Geometry::Point(_) => members
                .iter()
                .filter_map(|i| fires[*i].area_ha)
                .sum::<f64>(),
            other => area_ha(other, Crs::Wgs84).map_err(|e| anyhow!(e))?,
        };
        let status = members
            .iter()
            .map(|i| fires[*i].status)
            .max_by_key(FireStatus::rank)
            .unwrap_or(FireStatus::Unknown);
        let datetime = members.iter().filter_map(|i| fires[*i].datetime).max();

        Ok(FireGroup {
            name,
            zone,
            north,
            geometry,
            lat,
            lon,
            area_ha: area,
            status,
            datetime,
            region_id: String::new(),
            priority: u32::MAX,
            duration_days: 0,
            members: members.iter().map(|i| fires[*i].guid.clone()).collect(),
        })
    }
}

/// Stable group name from the centroid's basemap tile.
pub fn name_for(lat: f64, lon: f64, zones: &[ZoneRaster]) -> Result<(String, u8, bool)> {
    let raster = find_best_raster(zones, lon)
        .map_err(|e| anyhow!(e))
        .context("no fuels raster for group")?;
    let utm = raster.crs();
    let projected = project_point(Point::new(lon, lat), Crs::Wgs84, utm).map_err(|e| anyhow!(e))?;
    let easting = (projected.x() / 10_000.0).floor() as i64;
    let northing = (projected.y() / 10_000.0).floor() as i64;
    let basemap = easting * 1000 + northing;
    let hemisphere = if raster.north { 'N' } else { 'S' };
    Ok((
        format!("{}{}_{:05}", raster.zone, hemisphere, basemap),
        raster.zone,
        raster.north,
    ))
}

/// Fill in region, priority and duration from the bounds regions.
///
/// Regions are checked in priority order, so a centroid inside overlapping
/// regions takes the most urgent one. Groups outside every region keep the
/// run-level defaults and sort last.
pub fn assign_priorities(groups: &mut [FireGroup], regions: &[BoundsRegion], max_days: u32) {
    for group in groups.iter_mut() {
        group.duration_days = max_days;
        for region in regions {
            if region.contains(group.lat, group.lon) {
                group.region_id = region.id.clone();
                group.priority = region.priority;
                group.duration_days = region.duration_days.min(max_days);
                break;
            }
        }
    }
}

/// Normalize an agency fire id: `-` becomes `_` and a redundant leading or
/// trailing 4-digit year is stripped, so the same fire reported by two
/// feeds dedupes by id.
pub fn fix_name(guid: &str) -> String {
    let mut name = guid.trim().replace('-', "_");
    let is_year = |part: &str| part.len() == 4 && part.chars().all(|c| c.is_ascii_digit());
    if let Some((head, tail)) = name.rsplit_once('_') {
        if is_year(tail) && !head.is_empty() {
            name = head.to_string();
        }
    }
    if let Some((head, tail)) = name.split_once('_') {
        if is_year(head) && !tail.is_empty() {
            name = tail.to_string();
        }
    }
    name
}

fn merge_by_guid(fire_lists: Vec<Vec<FireFeature>>) -> Vec<FireFeature> {
    let mut merged: Vec<FireFeature> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for list in fire_lists {
        for mut fire in list {
            fire.guid = fix_name(&fire.guid);
            match index.get(&fire.guid) {
                Some(at) => {
                    debug!(guid = %fire.guid, "later source overrides fire");
                    merged[*at] = fire;
                }
                None => {
                    index.insert(fire.guid.clone(), merged.len());
                    merged.push(fire);
                }
            }
        }
    }
    merged
}

/// Point fires with a reported size become circles of equivalent area.
fn inflate_point_fire(fire: &mut FireFeature) -> Result<()> {
    let Geometry::Point(point) = fire.geometry else {
        return Ok(());
    };
    let Some(area) = fire.area_ha.filter(|a| *a > 0.0) else {
        return Ok(());
    };
    let center =
        project_point(point, Crs::Wgs84, Crs::LambertCanada).map_err(|e| anyhow!(e))?;
    let radius = area_ha_to_radius_m(area);
    let inflated = circle(center, radius, 64).simplify(&SIMPLIFY_TOLERANCE_M);
    fire.geometry = project_geometry(
        &Geometry::Polygon(inflated),
        Crs::LambertCanada,
        Crs::Wgs84,
    )
    .map_err(|e| anyhow!(e))?;
    Ok(())
}

/// Collapse duplicate ids into one record: union geometry, worst status,
/// latest datetime.
fn dissolve_by_guid(fires: Vec<FireFeature>) -> Result<Vec<FireFeature>> {
    let mut order: Vec<String> = Vec::new();
    let mut by_guid: HashMap<String, FireFeature> = HashMap::new();
    for fire in fires {
        match by_guid.get_mut(&fire.guid) {
            None => {
                order.push(fire.guid.clone());
                by_guid.insert(fire.guid.clone(), fire);
            }
            Some(existing) => {
                existing.geometry = union_geometries(&existing.geometry, &fire.geometry)?;
                if fire.status.rank() > existing.status.rank() {
                    existing.status = fire.status;
                }
                existing.datetime = existing.datetime.max(fire.datetime);
                existing.area_ha = match (existing.area_ha, fire.area_ha) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
            }
        }
    }
    Ok(order
        .into_iter()
        .map(|guid| by_guid.remove(&guid).expect("guid inserted above"))
        .collect())
}

/// Minimum distance in meters between two WGS84 geometries, measured in the
/// comparison CRS.
pub fn distance_m(a: &Geometry<f64>, b: &Geometry<f64>) -> Result<f64> {
    let a = project_geometry(a, Crs::Wgs84, Crs::LambertCanada).map_err(|e| anyhow!(e))?;
    let b = project_geometry(b, Crs::Wgs84, Crs::LambertCanada).map_err(|e| anyhow!(e))?;
    let mut min = f64::INFINITY;
    for pa in parts(&a) {
        for pb in parts(&b) {
            let d = match (&pa, &pb) {
                (Part::Point(x), Part::Point(y)) => x.euclidean_distance(y),
                (Part::Point(x), Part::Polygon(y)) => x.euclidean_distance(*y),
                (Part::Polygon(x), Part::Point(y)) => y.euclidean_distance(*x),
                (Part::Polygon(x), Part::Polygon(y)) => x.euclidean_distance(*y),
            };
            min = min.min(d);
        }
    }
    if min.is_finite() {
        Ok(min)
    } else {
        Err(anyhow!("cannot measure distance for empty geometry"))
    }
}

enum Part<'g> {
    Point(Point<f64>),
    Polygon(&'g geo::Polygon<f64>),
}

fn parts(geometry: &Geometry<f64>) -> Vec<Part<'_>> {
    match geometry {
        Geometry::Point(p) => vec![Part::Point(*p)],
        Geometry::MultiPoint(mp) => mp.iter().map(|p| Part::Point(*p)).collect(),
        Geometry::Polygon(p) => vec![Part::Polygon(p)],
        Geometry::MultiPolygon(mp) => mp.iter().map(Part::Polygon).collect(),
        Geometry::GeometryCollection(gc) => gc.iter().flat_map(parts).collect(),
        _ => Vec::new(),
    }
}

fn union_geometries(a: &Geometry<f64>, b: &Geometry<f64>) -> Result<Geometry<f64>> {
    let polys_a = polygons_of(a);
    let polys_b = polygons_of(b);
    if polys_a.0.is_empty() && polys_b.0.is_empty() {
        // two points: keep the first, grouping handles proximity
        return Ok(a.clone());
    }
    if polys_a.0.is_empty() {
        return Ok(Geometry::MultiPolygon(polys_b));
    }
    if polys_b.0.is_empty() {
        return Ok(Geometry::MultiPolygon(polys_a));
    }
    Ok(Geometry::MultiPolygon(polys_a.union(&polys_b)))
}

fn polygons_of(geometry: &Geometry<f64>) -> MultiPolygon<f64> {
    match geometry {
        Geometry::Polygon(p) => MultiPolygon(vec![p.clone()]),
        Geometry::MultiPolygon(mp) => mp.clone(),
        Geometry::GeometryCollection(gc) => {
            MultiPolygon(gc.iter().flat_map(|g| polygons_of(g).0).collect())
        }
        _ => MultiPolygon(vec![]),
    }
}

fn combined_geometry(fires: &[FireFeature], members: &[usize]) -> Result<Geometry<f64>> {
    let mut polygons = MultiPolygon(vec![]);
    for index in members {
        let more = polygons_of(&fires[*index].geometry);
        if !more.0.is_empty() {
            polygons = if polygons.0.is_empty() {
                more
            } else {
                polygons.union(&more)
            };
        }
    }
    if !polygons.0.is_empty() {
        return Ok(Geometry::MultiPolygon(polygons));
    }
    // all points: single point groups keep it, multi-point groups centre
    let points: Vec<Point<f64>> = members
        .iter()
        .filter_map(|i| match fires[*i].geometry {
            Geometry::Point(p) => Some(p),
            _ => None,
        })
        .collect();
    match points.len() {
        0 => Err(anyhow!("group has no usable geometry")),
        1 => Ok(Geometry::Point(points[0])),
        _ => {
            let x = points.iter().map(|p| p.x()).sum::<f64>() / points.len() as f64;
            let y = points.iter().map(|p| p.y()).sum::<f64>() / points.len() as f64;
            Ok(Geometry::Point(Point::new(x, y)))
        }
    }
}
