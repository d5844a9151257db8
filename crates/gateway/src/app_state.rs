use fleet_core::FleetContext;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) fleet: FleetContext,
}
