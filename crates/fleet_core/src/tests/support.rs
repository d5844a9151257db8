use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use fleet_backend::{BackendError, FleetBackend};
use shared::{
    domain::{Direction, RoverId, RoverStatus, SessionId, TaskName},
    protocol::{
        BatteryReading, CommandAck, CoordinateReading, RoverStatusReport, SensorReading,
    },
};

use crate::{FleetContext, FleetOptions, FleetProfile};

/// In-process stand-in for the rover backend. Keeps one report per rover and
/// applies commands to it the way the real fleet does.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    rovers: Mutex<HashMap<RoverId, RoverStatusReport>>,
    failing: Mutex<HashSet<RoverId>>,
    soil: Mutex<HashMap<RoverId, [f64; 3]>>,
    pub aggregate_fails: AtomicBool,
    pub commands_uncertain: AtomicBool,
    pub refuse_sessions: AtomicBool,
    move_delay: Mutex<Duration>,
    read_delay: Mutex<Duration>,
    aggregate_delay: Mutex<Duration>,
    sessions: AtomicUsize,
    pub commands_sent: AtomicUsize,
    pub status_reads: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(profile: &FleetProfile) -> Self {
        let backend = Self::default();
        {
            let mut rovers = backend.rovers.lock().expect("rovers");
            for (index, rover) in profile.rovers.iter().enumerate() {
                rovers.insert(
                    rover.clone(),
                    RoverStatusReport {
                        status: RoverStatus::Idle,
                        battery: 90 - index as u8 * 10,
                        coordinates: [index as i64, 0],
                        task: None,
                    },
                );
            }
        }
        backend
    }

    pub fn fail_rover(&self, rover: &str) {
        self.failing
            .lock()
            .expect("failing")
            .insert(RoverId::new(rover));
    }

    pub fn set_battery(&self, rover: &str, battery: u8) {
        if let Some(report) = self
            .rovers
            .lock()
            .expect("rovers")
            .get_mut(&RoverId::new(rover))
        {
            report.battery = battery;
        }
    }

    pub fn set_coordinates(&self, rover: &str, coordinates: [i64; 2]) {
        if let Some(report) = self
            .rovers
            .lock()
            .expect("rovers")
            .get_mut(&RoverId::new(rover))
        {
            report.coordinates = coordinates;
        }
    }

    /// Moisture, pH and temperature the rover reports from now on.
    pub fn set_soil(&self, rover: &str, readings: [f64; 3]) {
        self.soil
            .lock()
            .expect("soil")
            .insert(RoverId::new(rover), readings);
    }

    pub fn set_move_delay(&self, delay: Duration) {
        *self.move_delay.lock().expect("delay") = delay;
    }

    /// Reads answer this late, with the state as it was when they were asked.
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().expect("delay") = delay;
    }

    pub fn set_aggregate_delay(&self, delay: Duration) {
        *self.aggregate_delay.lock().expect("delay") = delay;
    }

    pub fn report(&self, rover: &str) -> RoverStatusReport {
        self.rovers
            .lock()
            .expect("rovers")
            .get(&RoverId::new(rover))
            .cloned()
            .expect("known rover")
    }

    fn lookup(&self, rover: &RoverId) -> Result<RoverStatusReport, BackendError> {
        if self.failing.lock().expect("failing").contains(rover) {
            return Err(BackendError::Unavailable {
                rover: Some(rover.clone()),
                status: Some(503),
                message: "rover offline".to_string(),
            });
        }
        self.rovers
            .lock()
            .expect("rovers")
            .get(rover)
            .cloned()
            .ok_or_else(|| BackendError::Unavailable {
                rover: Some(rover.clone()),
                status: Some(404),
                message: "unknown rover".to_string(),
            })
    }

    async fn read(&self, rover: &RoverId) -> Result<RoverStatusReport, BackendError> {
        let reply = self.lookup(rover);
        let delay = *self.read_delay.lock().expect("delay");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        reply
    }

    fn command(
        &self,
        rover: &RoverId,
        message: String,
        change: impl FnOnce(&mut RoverStatusReport),
    ) -> Result<CommandAck, BackendError> {
        self.lookup(rover)?;
        self.commands_sent.fetch_add(1, Ordering::SeqCst);
        if self.commands_uncertain.load(Ordering::SeqCst) {
            return Err(BackendError::CommandUncertain {
                rover: rover.clone(),
            });
        }
        if let Some(report) = self.rovers.lock().expect("rovers").get_mut(rover) {
            change(report);
        }
        Ok(CommandAck { message })
    }
}

#[async_trait]
impl FleetBackend for ScriptedBackend {
    async fn start_session(&self) -> Result<SessionId, BackendError> {
        if self.refuse_sessions.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable {
                rover: None,
                status: Some(500),
                message: "session service down".to_string(),
            });
        }
        let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionId::new(format!("session-{n}")))
    }

    async fn fleet_status(
        &self,
        _session: &SessionId,
    ) -> Result<HashMap<RoverId, RoverStatusReport>, BackendError> {
        let delay = *self.aggregate_delay.lock().expect("delay");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.aggregate_fails.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable {
                rover: None,
                status: Some(500),
                message: "fleet status unavailable".to_string(),
            });
        }
        let failing = self.failing.lock().expect("failing").clone();
        Ok(self
            .rovers
            .lock()
            .expect("rovers")
            .iter()
            .filter(|(rover, _)| !failing.contains(*rover))
            .map(|(rover, report)| (rover.clone(), report.clone()))
            .collect())
    }

    async fn rover_status(
        &self,
        _session: &SessionId,
        rover: &RoverId,
    ) -> Result<RoverStatusReport, BackendError> {
        self.status_reads.fetch_add(1, Ordering::SeqCst);
        self.read(rover).await
    }

    async fn sensor_data(
        &self,
        _session: &SessionId,
        rover: &RoverId,
    ) -> Result<SensorReading, BackendError> {
        let report = self.read(rover).await?;
        let [soil_moisture, soil_ph, temperature] = self
            .soil
            .lock()
            .expect("soil")
            .get(rover)
            .copied()
            .unwrap_or([41.5, 6.8, 22.0]);
        Ok(SensorReading {
            timestamp: 1_700_000_000.0,
            rover_id: rover.clone(),
            soil_moisture,
            soil_ph,
            temperature,
            battery_level: f64::from(report.battery),
        })
    }

    async fn battery(
        &self,
        _session: &SessionId,
        rover: &RoverId,
    ) -> Result<BatteryReading, BackendError> {
        let report = self.read(rover).await?;
        Ok(BatteryReading {
            rover_id: rover.clone(),
            battery_level: f64::from(report.battery),
        })
    }

    async fn coordinates(
        &self,
        _session: &SessionId,
        rover: &RoverId,
    ) -> Result<CoordinateReading, BackendError> {
        let report = self.read(rover).await?;
        Ok(CoordinateReading {
            rover_id: rover.clone(),
            coordinates: report.coordinates,
        })
    }

    async fn move_rover(
        &self,
        _session: &SessionId,
        rover: &RoverId,
        direction: &Direction,
    ) -> Result<CommandAck, BackendError> {
        let delay = *self.move_delay.lock().expect("delay");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.command(rover, format!("{rover} moving {direction}"), |report| {
            report.status = RoverStatus::Moving;
            report.battery = report.battery.saturating_sub(5);
            report.coordinates[1] += 1;
        })
    }

    async fn reset_rover(
        &self,
        _session: &SessionId,
        rover: &RoverId,
    ) -> Result<CommandAck, BackendError> {
        self.command(rover, format!("{rover} reset"), |report| {
            report.status = RoverStatus::Idle;
            report.battery = 100;
            report.task = None;
        })
    }

    async fn assign_task(
        &self,
        _session: &SessionId,
        rover: &RoverId,
        task: &TaskName,
    ) -> Result<CommandAck, BackendError> {
        let assigned = task.clone();
        self.command(rover, format!("{rover} assigned {task}"), move |report| {
            report.task = Some(assigned);
        })
    }
}

pub(crate) fn context_with(backend: Arc<ScriptedBackend>, profile: FleetProfile) -> FleetContext {
    FleetContext::new(
        profile,
        backend,
        FleetOptions {
            fan_out_timeout: Duration::from_secs(2),
            ..FleetOptions::default()
        },
    )
}

/// A context over the stock five-rover fleet.
pub(crate) fn scripted_context() -> (FleetContext, Arc<ScriptedBackend>) {
    let profile = FleetProfile::default();
    let backend = Arc::new(ScriptedBackend::new(&profile));
    (context_with(backend.clone(), profile), backend)
}
