// Lock order is always record shard, then cell shard. Queries never hold a
// cell guard while reading a record.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::geo::{haversine_km, EARTH_RADIUS_KM};
use crate::models::driver::{DriverLocationRecord, GeoPoint, NearbyDriver};
use crate::models::DriverId;

type CellKey = (i32, i32);

// Cells visited per indexed record before falling back to a linear scan.
const CELLS_PER_RECORD: usize = 4;
const MIN_CELL_BUDGET: usize = 64;

pub struct GeoIndex {
    cell_degrees: f64,
    records: DashMap<DriverId, DriverLocationRecord>,
    cells: DashMap<CellKey, HashSet<DriverId>>,
    available: AtomicUsize,
}

struct Candidate {
    driver_id: DriverId,
    distance_km: f64,
    updated_at: DateTime<Utc>,
}

impl GeoIndex {
    pub fn new(cell_degrees: f64) -> Self {
        Self {
            cell_degrees,
            records: DashMap::new(),
            cells: DashMap::new(),
            available: AtomicUsize::new(0),
        }
    }

    pub fn upsert(&self, driver_id: DriverId, point: GeoPoint, available: bool) -> DriverLocationRecord {
        self.upsert_at(driver_id, point, available, Utc::now())
    }

    pub fn upsert_at(
        &self,
        driver_id: DriverId,
        point: GeoPoint,
        available: bool,
        at: DateTime<Utc>,
    ) -> DriverLocationRecord {
        let new_cell = available.then(|| self.cell_of(&point));

        // The entry guard is held across the cell move so updates for one
        // driver serialize with each other.
        match self.records.entry(driver_id) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                let old_cell = record.available.then(|| self.cell_of(&record.location));
                record.location = point;
                record.available = available;
                record.updated_at = at;
                self.move_cell(driver_id, old_cell, new_cell);
                record.clone()
            }
            Entry::Vacant(vacant) => {
                let record = DriverLocationRecord {
                    id: Uuid::new_v4(),
                    driver_id,
                    location: point,
                    available,
                    updated_at: at,
                };
                self.move_cell(driver_id, None, new_cell);
                vacant.insert(record.clone());
                record
            }
        }
    }

    pub fn set_availability(&self, driver_id: DriverId, available: bool) -> Option<DriverLocationRecord> {
        let mut record = self.records.get_mut(&driver_id)?;
        let old_cell = record.available.then(|| self.cell_of(&record.location));
        let new_cell = available.then(|| self.cell_of(&record.location));
        record.available = available;
        record.updated_at = Utc::now();
        self.move_cell(driver_id, old_cell, new_cell);
        Some(record.clone())
    }

    // The record is kept but excluded from queries.
    pub fn remove(&self, driver_id: DriverId) -> Option<DriverLocationRecord> {
        self.set_availability(driver_id, false)
    }

    pub fn get(&self, driver_id: &DriverId) -> Option<DriverLocationRecord> {
        self.records.get(driver_id).map(|record| record.value().clone())
    }

    pub fn available_count(&self) -> usize {
        self.available.load(AtomicOrdering::Relaxed)
    }

    /// Up to `k` available drivers accepted by `filter`, closest first. Equal
    /// distances are ordered by the older `updated_at`, then by id.
    pub fn nearest<F>(&self, point: &GeoPoint, k: usize, filter: F) -> Vec<NearbyDriver>
    where
        F: Fn(&DriverId) -> bool,
    {
        if k == 0 || self.available_count() == 0 {
            return Vec::new();
        }

        let origin = self.cell_of(point);
        let budget = (self.records.len() * CELLS_PER_RECORD).max(MIN_CELL_BUDGET);
        let max_ring = (360.0 / self.cell_degrees).ceil() as i32;

        let mut seen: HashSet<DriverId> = HashSet::new();
        let mut found: Vec<Candidate> = Vec::new();
        let mut visited = 0usize;

        for ring in 0..=max_ring {
            if found.len() >= k {
                found.sort_by(compare_candidates);
                found.truncate(k);
                if self.ring_lower_bound_km(point, ring) > found[k - 1].distance_km {
                    break;
                }
            }

            let ring_cells = self.ring_cells(origin, ring);
            visited += ring_cells.len();
            if visited > budget {
                return self.scan(point, k, &filter);
            }

            for cell in ring_cells {
                let ids: Vec<DriverId> = match self.cells.get(&cell) {
                    Some(ids) => ids.iter().copied().collect(),
                    None => continue,
                };
                for driver_id in ids {
                    if !seen.insert(driver_id) || !filter(&driver_id) {
                        continue;
                    }
                    if let Some(candidate) = self.candidate(&driver_id, point) {
                        found.push(candidate);
                    }
                }
            }
        }

        finish(found, k)
    }

    fn scan<F>(&self, point: &GeoPoint, k: usize, filter: &F) -> Vec<NearbyDriver>
    where
        F: Fn(&DriverId) -> bool,
    {
        let found = self
            .records
            .iter()
            .filter(|entry| entry.available && filter(entry.key()))
            .map(|entry| Candidate {
                driver_id: entry.driver_id,
                distance_km: haversine_km(&entry.location, point),
                updated_at: entry.updated_at,
            })
            .collect();

        finish(found, k)
    }

    fn candidate(&self, driver_id: &DriverId, point: &GeoPoint) -> Option<Candidate> {
        let record = self.records.get(driver_id)?;
        if !record.available {
            return None;
        }
        Some(Candidate {
            driver_id: record.driver_id,
            distance_km: haversine_km(&record.location, point),
            updated_at: record.updated_at,
        })
    }

    fn move_cell(&self, driver_id: DriverId, from: Option<CellKey>, to: Option<CellKey>) {
        if from == to {
            return;
        }

        if let Some(cell) = from {
            if let Some(mut ids) = self.cells.get_mut(&cell) {
                ids.remove(&driver_id);
            }
            self.cells.remove_if(&cell, |_, ids| ids.is_empty());
        }
        if let Some(cell) = to {
            self.cells.entry(cell).or_default().insert(driver_id);
        }

        match (from.is_some(), to.is_some()) {
            (false, true) => {
                self.available.fetch_add(1, AtomicOrdering::Relaxed);
            }
            (true, false) => {
                self.available.fetch_sub(1, AtomicOrdering::Relaxed);
            }
            _ => {}
        }
    }

    fn cell_of(&self, point: &GeoPoint) -> CellKey {
        // 180 and -180 are the same meridian.
        let lng = if point.lng >= 180.0 { point.lng - 360.0 } else { point.lng };
        (
            (point.lat / self.cell_degrees).floor() as i32,
            (lng / self.cell_degrees).floor() as i32,
        )
    }

    fn lat_rows(&self) -> (i32, i32) {
        (
            (-90.0 / self.cell_degrees).floor() as i32,
            (90.0 / self.cell_degrees).floor() as i32,
        )
    }

    fn lng_columns(&self) -> (i32, i32) {
        let min = (-180.0 / self.cell_degrees).floor() as i32;
        let max = ((180.0 - f64::EPSILON) / self.cell_degrees).floor() as i32;
        (min, max - min + 1)
    }

    fn ring_cells(&self, origin: CellKey, ring: i32) -> Vec<CellKey> {
        let (row, col) = origin;
        if ring == 0 {
            return vec![origin];
        }

        let (min_row, max_row) = self.lat_rows();
        let (min_col, columns) = self.lng_columns();
        let wrap = |c: i32| min_col + (c - min_col).rem_euclid(columns);

        let mut cells = Vec::with_capacity(8 * ring as usize);
        for dc in -ring..=ring {
            cells.push((row - ring, wrap(col + dc)));
            cells.push((row + ring, wrap(col + dc)));
        }
        for dr in (-ring + 1)..ring {
            cells.push((row + dr, wrap(col - ring)));
            cells.push((row + dr, wrap(col + ring)));
        }
        cells.retain(|(r, _)| (min_row..=max_row).contains(r));
        cells
    }

    fn ring_lower_bound_km(&self, point: &GeoPoint, ring: i32) -> f64 {
        if ring <= 1 {
            return 0.0;
        }

        // Rows differ by at least `ring` cells.
        let lat_gap = (ring - 1) as f64 * self.cell_degrees;
        let by_lat = EARTH_RADIUS_KM * lat_gap.to_radians();

        // Columns differ by at least `ring` cells; partial cells at the
        // antimeridian can shave up to two cell widths off the gap.
        let lng_gap = ((ring - 3).max(0) as f64 * self.cell_degrees).min(180.0);
        let max_lat = (point.lat.abs() + (ring + 1) as f64 * self.cell_degrees).min(90.0);
        let shrink = max_lat.to_radians().cos();
        let by_lng = 2.0 * EARTH_RADIUS_KM * (shrink * (lng_gap.to_radians() / 2.0).sin()).asin();

        by_lat.min(by_lng)
    }
}

fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    a.distance_km
        .total_cmp(&b.distance_km)
        .then_with(|| a.updated_at.cmp(&b.updated_at))
        .then_with(|| a.driver_id.cmp(&b.driver_id))
}

fn finish(mut found: Vec<Candidate>, k: usize) -> Vec<NearbyDriver> {
    found.sort_by(compare_candidates);
    found.truncate(k);
    found
        .into_iter()
        .map(|candidate| NearbyDriver {
            driver_id: candidate.driver_id,
            distance_km: candidate.distance_km,
        })
        .collect()
}
