//! Operator commands accepted by `SimulationHandle::dispatch_command`.

use std::fmt;

/// Built-in clock commands; anything else is forwarded to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulationCommand {
    Start,
    Pause,
    Resume,
    Step,
    Stop,
    Clear,
    Restart,
    /// Forwarded verbatim to `TopologyObserver::on_command` on the scheduler thread.
    Custom(String),
}

impl SimulationCommand {
    /// Built-in names are matched case-insensitively after trimming.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "start" => SimulationCommand::Start,
            "pause" => SimulationCommand::Pause,
            "resume" => SimulationCommand::Resume,
            "step" => SimulationCommand::Step,
            "stop" => SimulationCommand::Stop,
            "clear" => SimulationCommand::Clear,
            "restart" => SimulationCommand::Restart,
            _ => SimulationCommand::Custom(trimmed.to_string()),
        }
    }
}

impl fmt::Display for SimulationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulationCommand::Start => write!(f, "start"),
            SimulationCommand::Pause => write!(f, "pause"),
            SimulationCommand::Resume => write!(f, "resume"),
            SimulationCommand::Step => write!(f, "step"),
            SimulationCommand::Stop => write!(f, "stop"),
            SimulationCommand::Clear => write!(f, "clear"),
            SimulationCommand::Restart => write!(f, "restart"),
            SimulationCommand::Custom(command) => write!(f, "{}", command),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_builtins_and_keeps_custom_text() {
        assert_eq!(SimulationCommand::parse(" Pause\n"), SimulationCommand::Pause);
        assert_eq!(SimulationCommand::parse("restart"), SimulationCommand::Restart);
        assert_eq!(
            SimulationCommand::parse(" color #3 red "),
            SimulationCommand::Custom("color #3 red".to_string())
        );
        assert_eq!(SimulationCommand::Step.to_string(), "step");
    }
}
