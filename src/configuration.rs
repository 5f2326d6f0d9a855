//! Match parameters.
//!
//! A [`Configuration`] is created programmatically with [`Configuration::new()`] or read once
//! from environment variables with [`Configuration::from_env()`], then handed explicitly to
//! [`run_match`](crate::server::run_match). The engine never reads the environment itself.
//!
//! # Environment Variables
//!
//! All values are optional. Flags are enabled by the value `"true"` (case-insensitive).
//!
//! - `MATCH_BOARD_SIZE`: Side length of the square board (default: `16`)
//! - `MATCH_MAX_ROUNDS`: Rounds played before the cutoff decides the winner (default: `250`)
//! - `MATCH_SEED`: Seed of every random choice in the match (default: `1337`)
//! - `MATCH_SENSOR_RADIUS`: Chebyshev radius pawns can sense (default: `2`)
//! - `MATCH_DEBUG`: Echo agent logs and board renders through tracing (default: `false`)
//! - `MATCH_LOG`: Enable logging to a file (default: `false`)

/// Parameters of one match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Configuration {
    pub(crate) board_size: usize,
    pub(crate) max_rounds: u32,
    pub(crate) seed: u64,
    pub(crate) sensor_radius: usize,
    pub(crate) debug: bool,
    pub(crate) log: bool,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - The board is 16 by 16.
    /// - The match is cut off after 250 rounds.
    /// - The seed is 1337.
    /// - Pawns sense two cells around them.
    /// - Agent logs are only kept in the match result.
    /// - Logging to file is disabled.
    pub fn new() -> Self {
        Self {
            board_size: 16,
            max_rounds: 250,
            seed: 1337,
            sensor_radius: 2,
            debug: false,
            log: false,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Unset or unparsable variables keep their default value.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        fn get_env_number<T: std::str::FromStr>(var: &str, default: T) -> T {
            std::env::var(var)
                .ok()
                .and_then(|val| val.parse().ok())
                .unwrap_or(default)
        }

        let default = Self::new();
        default
            .with_board_size(get_env_number("MATCH_BOARD_SIZE", default.board_size))
            .with_max_rounds(get_env_number("MATCH_MAX_ROUNDS", default.max_rounds))
            .with_seed(get_env_number("MATCH_SEED", default.seed))
            .with_sensor_radius(get_env_number("MATCH_SENSOR_RADIUS", default.sensor_radius))
            .with_debug(get_env_flag("MATCH_DEBUG", default.debug))
            .with_log(get_env_flag("MATCH_LOG", default.log))
    }

    /// Set the side length of the board. Sizes below 2 are raised to 2.
    pub fn with_board_size(mut self, value: usize) -> Self {
        self.board_size = value.max(2);
        self
    }

    /// Set the number of rounds before the cutoff.
    pub fn with_max_rounds(mut self, value: u32) -> Self {
        self.max_rounds = value;
        self
    }

    /// Set the match seed.
    pub fn with_seed(mut self, value: u64) -> Self {
        self.seed = value;
        self
    }

    /// Set the pawn sensor radius.
    pub fn with_sensor_radius(mut self, value: usize) -> Self {
        self.sensor_radius = value;
        self
    }

    /// Enable or disable echoing agent logs and board renders (debug purposes only).
    pub fn with_debug(mut self, value: bool) -> Self {
        self.debug = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    pub fn board_size(&self) -> usize {
        self.board_size
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_override_defaults() {
        let config = Configuration::new()
            .with_board_size(8)
            .with_seed(3)
            .with_max_rounds(10);
        assert_eq!(config.board_size(), 8);
        assert_eq!(config.seed(), 3);
        assert_eq!(config.max_rounds(), 10);
        assert_eq!(config.sensor_radius, 2);
    }

    #[test]
    fn board_has_room_for_both_home_rows() {
        assert_eq!(Configuration::new().with_board_size(0).board_size(), 2);
    }

    #[test]
    fn environment_board_size_is_clamped() {
        for (value, expected) in [("0", 2), ("1", 2), ("9", 9), ("many", 16)] {
            std::env::set_var("MATCH_BOARD_SIZE", value);
            assert_eq!(Configuration::from_env().board_size(), expected, "{value}");
        }
        std::env::remove_var("MATCH_BOARD_SIZE");
        assert_eq!(Configuration::from_env().board_size(), 16);
    }
}
