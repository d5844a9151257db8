use std::collections::BTreeMap;

use shared::{
    domain::{Direction, RoverId, TaskName},
    error::{ApiError, ErrorCode},
};

use crate::sensors::SensorTolerances;

/// Capability sets for one deployment: which rovers exist, which directions
/// and tasks they accept, and what those cost in battery.
#[derive(Debug, Clone)]
pub struct FleetProfile {
    pub rovers: Vec<RoverId>,
    pub directions: Vec<Direction>,
    pub tasks: Vec<TaskName>,
    /// Battery percentage a rover must still have after a move or task.
    pub battery_reserve: u8,
    pub move_battery_cost: u8,
    /// Tasks missing here cost nothing.
    pub task_battery_costs: BTreeMap<TaskName, u8>,
    /// Rovers a coordinated task asks for. Tasks missing here need one.
    pub task_crews: BTreeMap<TaskName, usize>,
    pub sensor_tolerances: SensorTolerances,
}

impl Default for FleetProfile {
    fn default() -> Self {
        Self {
            rovers: (1..=5).map(|n| RoverId::new(format!("Rover-{n}"))).collect(),
            directions: ["forward", "backward", "left", "right"]
                .into_iter()
                .map(Direction::new)
                .collect(),
            tasks: ["Soil Analysis", "Irrigation", "Weeding", "Crop Monitoring"]
                .into_iter()
                .map(TaskName::new)
                .collect(),
            battery_reserve: 10,
            move_battery_cost: 5,
            task_battery_costs: [
                ("Soil Analysis", 5),
                ("Irrigation", 10),
                ("Weeding", 8),
                ("Crop Monitoring", 4),
            ]
            .into_iter()
            .map(|(task, cost)| (TaskName::new(task), cost))
            .collect(),
            task_crews: [("Irrigation", 2), ("Weeding", 2)]
                .into_iter()
                .map(|(task, crew)| (TaskName::new(task), crew))
                .collect(),
            sensor_tolerances: SensorTolerances::default(),
        }
    }
}

impl FleetProfile {
    pub fn direction(&self, raw: &str) -> Result<Direction, ApiError> {
        let raw = required(raw, "direction")?;
        self.directions
            .iter()
            .find(|direction| direction.as_str() == raw)
            .cloned()
            .ok_or_else(|| {
                ApiError::new(
                    ErrorCode::InvalidDirection,
                    format!(
                        "Invalid direction. Must be one of: {}",
                        join(&self.directions)
                    ),
                )
            })
    }

    pub fn task(&self, raw: &str) -> Result<TaskName, ApiError> {
        let raw = required(raw, "task")?;
        self.tasks
            .iter()
            .find(|task| task.as_str() == raw)
            .cloned()
            .ok_or_else(|| {
                ApiError::new(
                    ErrorCode::InvalidTask,
                    format!("Invalid task. Must be one of: {}", join(&self.tasks)),
                )
            })
    }

    pub fn task_battery_cost(&self, task: &TaskName) -> u8 {
        self.task_battery_costs.get(task).copied().unwrap_or(0)
    }

    pub fn task_crew(&self, task: &TaskName) -> usize {
        self.task_crews.get(task).copied().unwrap_or(1).max(1)
    }

    pub fn can_move(&self, battery: u8) -> bool {
        self.keeps_reserve(battery, self.move_battery_cost)
    }

    pub fn can_run(&self, task: &TaskName, battery: u8) -> bool {
        self.keeps_reserve(battery, self.task_battery_cost(task))
    }

    /// Moves left before the battery would drop under the reserve.
    pub fn moves_left(&self, battery: u8) -> u32 {
        let spare = u32::from(battery.saturating_sub(self.battery_reserve));
        match self.move_battery_cost {
            0 => u32::MAX,
            cost => spare / u32::from(cost),
        }
    }

    fn keeps_reserve(&self, battery: u8, cost: u8) -> bool {
        u16::from(battery) >= u16::from(cost) + u16::from(self.battery_reserve)
    }
}

pub(crate) fn required<'a>(raw: &'a str, field: &str) -> Result<&'a str, ApiError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ApiError::new(
            ErrorCode::MissingField,
            format!("{field} is required"),
        ));
    }
    Ok(trimmed)
}

pub(crate) fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_matches_stock_fleet() {
        let profile = FleetProfile::default();
        assert_eq!(profile.rovers.len(), 5);
        assert_eq!(profile.rovers[4].as_str(), "Rover-5");
        assert!(profile.direction("backward").is_ok());
        assert!(profile.task("Crop Monitoring").is_ok());
    }

    #[test]
    fn rejects_values_outside_capability_sets() {
        let profile = FleetProfile::default();
        assert_eq!(
            profile.direction("up").expect_err("direction").code,
            ErrorCode::InvalidDirection
        );
        assert_eq!(
            profile.task("Harvesting").expect_err("task").code,
            ErrorCode::InvalidTask
        );
        assert_eq!(
            profile.direction("  ").expect_err("blank").code,
            ErrorCode::MissingField
        );
    }

    #[test]
    fn battery_must_cover_the_cost_and_keep_the_reserve() {
        let profile = FleetProfile::default();
        assert!(profile.can_move(15));
        assert!(!profile.can_move(14));

        let irrigation = TaskName::new("Irrigation");
        assert!(profile.can_run(&irrigation, 20));
        assert!(!profile.can_run(&irrigation, 19));

        // unknown tasks only need the reserve
        assert!(profile.can_run(&TaskName::new("Harvesting"), 10));
        assert!(!profile.can_run(&TaskName::new("Harvesting"), 9));
    }

    #[test]
    fn moves_left_counts_down_to_the_reserve() {
        let profile = FleetProfile::default();
        assert_eq!(profile.moves_left(100), 18);
        assert_eq!(profile.moves_left(14), 0);
        assert_eq!(profile.moves_left(3), 0);

        let free = FleetProfile {
            move_battery_cost: 0,
            ..FleetProfile::default()
        };
        assert_eq!(free.moves_left(50), u32::MAX);
    }

    #[test]
    fn crews_default_to_one_rover() {
        let profile = FleetProfile::default();
        assert_eq!(profile.task_crew(&TaskName::new("Weeding")), 2);
        assert_eq!(profile.task_crew(&TaskName::new("Soil Analysis")), 1);
    }

    #[test]
    fn capability_sets_can_grow_through_configuration() {
        let mut profile = FleetProfile::default();
        profile.directions.push(Direction::new("north"));
        profile.tasks.push(TaskName::new("Harvesting"));
        assert!(profile.direction("north").is_ok());
        assert!(profile.task("Harvesting").is_ok());
    }
}
