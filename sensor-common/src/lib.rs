pub mod dedupe;
pub mod event;
pub mod fingerprint;
pub mod geofence;
pub mod store;
pub mod test_utils;
