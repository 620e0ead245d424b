use std::collections::HashSet;

use dashmap::DashMap;
use tracing::debug;

use crate::error::AppError;
use crate::geo::index::GeoIndex;
use crate::models::driver::{DriverLocationRecord, GeoPoint, NearbyDriver};
use crate::models::{DriverId, LocationRecordId};
use crate::observability::metrics::Metrics;

pub struct DriverRegistry {
    index: GeoIndex,
    records: DashMap<DriverId, LocationRecordId>,
    metrics: Metrics,
}

impl DriverRegistry {
    pub fn new(cell_degrees: f64, metrics: Metrics) -> Self {
        Self {
            index: GeoIndex::new(cell_degrees),
            records: DashMap::new(),
            metrics,
        }
    }

    pub fn report_location(
        &self,
        driver_id: DriverId,
        lat: f64,
        lng: f64,
        available: bool,
    ) -> Result<DriverLocationRecord, AppError> {
        let point = GeoPoint::new(lat, lng);
        if !point.is_valid() {
            return Err(AppError::InvalidCoordinate { lat, lng });
        }

        let record = self.index.upsert(driver_id, point, available);
        self.records.entry(driver_id).or_insert(record.id);
        self.refresh_gauge();

        debug!(
            driver_id = %driver_id,
            lat,
            lng,
            available,
            "driver location reported"
        );
        Ok(record)
    }

    // Unspecified fields keep their current value.
    pub fn update_location(
        &self,
        driver_id: DriverId,
        lat: Option<f64>,
        lng: Option<f64>,
        available: Option<bool>,
    ) -> Result<DriverLocationRecord, AppError> {
        let current = self.location(driver_id)?;
        self.report_location(
            driver_id,
            lat.unwrap_or(current.location.lat),
            lng.unwrap_or(current.location.lng),
            available.unwrap_or(current.available),
        )
    }

    pub fn set_availability(
        &self,
        driver_id: DriverId,
        available: bool,
    ) -> Result<DriverLocationRecord, AppError> {
        let record = self
            .index
            .set_availability(driver_id, available)
            .ok_or(AppError::DriverNotFound(driver_id))?;
        self.refresh_gauge();

        debug!(driver_id = %driver_id, available, "driver availability changed");
        Ok(record)
    }

    pub fn location(&self, driver_id: DriverId) -> Result<DriverLocationRecord, AppError> {
        self.index
            .get(&driver_id)
            .ok_or(AppError::DriverNotFound(driver_id))
    }

    pub fn record_id(&self, driver_id: DriverId) -> Option<LocationRecordId> {
        self.records.get(&driver_id).map(|id| *id)
    }

    pub fn available_drivers_near(
        &self,
        point: &GeoPoint,
        k: usize,
        exclude: &HashSet<DriverId>,
    ) -> Vec<NearbyDriver> {
        self.index.nearest(point, k, |driver_id| !exclude.contains(driver_id))
    }

    pub fn driver_count(&self) -> usize {
        self.records.len()
    }

    pub fn available_count(&self) -> usize {
        self.index.available_count()
    }

    fn refresh_gauge(&self) {
        self.metrics
            .drivers_available
            .set(self.index.available_count() as i64);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use uuid::Uuid;

    use super::DriverRegistry;
    use crate::error::AppError;
    use crate::models::driver::GeoPoint;
    use crate::observability::metrics::Metrics;

    fn registry() -> DriverRegistry {
        DriverRegistry::new(0.05, Metrics::new())
    }

    #[test]
    fn out_of_range_latitude_is_rejected_without_touching_state() {
        let registry = registry();
        let driver = Uuid::new_v4();
        registry.report_location(driver, 12.0, 56.0, true).unwrap();

        let err = registry.report_location(driver, 91.0, 0.0, true).unwrap_err();
        assert!(matches!(err, AppError::InvalidCoordinate { .. }));

        let record = registry.location(driver).unwrap();
        assert_eq!(record.location, GeoPoint::new(12.0, 56.0));
        assert!(record.available);
    }

    #[test]
    fn first_report_for_unknown_driver_with_bad_longitude_creates_nothing() {
        let registry = registry();
        let driver = Uuid::new_v4();
        assert!(registry.report_location(driver, 0.0, 181.0, true).is_err());
        assert!(registry.record_id(driver).is_none());
        assert!(matches!(
            registry.location(driver),
            Err(AppError::DriverNotFound(_))
        ));
    }

    #[test]
    fn repeated_reports_are_idempotent_apart_from_timestamp() {
        let registry = registry();
        let driver = Uuid::new_v4();
        let first = registry.report_location(driver, 1.5, 2.5, true).unwrap();
        let second = registry.report_location(driver, 1.5, 2.5, true).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.location, second.location);
        assert_eq!(first.available, second.available);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(registry.driver_count(), 1);
        assert_eq!(registry.available_count(), 1);
        assert_eq!(registry.record_id(driver), Some(first.id));
    }

    #[test]
    fn availability_toggle_keeps_position() {
        let registry = registry();
        let driver = Uuid::new_v4();
        registry.report_location(driver, 3.0, 4.0, true).unwrap();

        let record = registry.set_availability(driver, false).unwrap();
        assert_eq!(record.location, GeoPoint::new(3.0, 4.0));
        assert!(
            registry
                .available_drivers_near(&GeoPoint::new(3.0, 4.0), 5, &HashSet::new())
                .is_empty()
        );

        registry.set_availability(driver, true).unwrap();
        assert_eq!(
            registry
                .available_drivers_near(&GeoPoint::new(3.0, 4.0), 5, &HashSet::new())
                .len(),
            1
        );
    }

    #[test]
    fn availability_for_unknown_driver_is_not_found() {
        let registry = registry();
        let err = registry.set_availability(Uuid::new_v4(), true).unwrap_err();
        assert!(matches!(err, AppError::DriverNotFound(_)));
    }

    #[test]
    fn partial_update_keeps_unspecified_fields() {
        let registry = registry();
        let driver = Uuid::new_v4();
        registry.report_location(driver, 10.0, 20.0, true).unwrap();

        let record = registry
            .update_location(driver, Some(10.5), None, Some(false))
            .unwrap();
        assert_eq!(record.location, GeoPoint::new(10.5, 20.0));
        assert!(!record.available);

        assert!(matches!(
            registry.update_location(Uuid::new_v4(), Some(1.0), None, None),
            Err(AppError::DriverNotFound(_))
        ));
    }

    #[test]
    fn exclusion_set_is_honoured() {
        let registry = registry();
        let pickup = GeoPoint::new(12.34, 56.78);
        let near = Uuid::from_u128(1);
        let far = Uuid::from_u128(2);
        registry.report_location(near, 12.341, 56.78, true).unwrap();
        registry.report_location(far, 12.36, 56.78, true).unwrap();

        let exclude: HashSet<_> = [near].into_iter().collect();
        let results = registry.available_drivers_near(&pickup, 5, &exclude);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].driver_id, far);
    }
}
