//! Load-balancing strategy selection.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    LeastLoad,
    RoundRobin,
    Weighted,
    Random,
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "least_load" => Ok(Strategy::LeastLoad),
            "round_robin" => Ok(Strategy::RoundRobin),
            "weighted" => Ok(Strategy::Weighted),
            "random" => Ok(Strategy::Random),
            other => Err(format!("unknown load balancer strategy: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_least_load() {
        assert_eq!(Strategy::default(), Strategy::LeastLoad);
    }

    #[test]
    fn parses_known_strategies() {
        assert_eq!("round_robin".parse::<Strategy>().unwrap(), Strategy::RoundRobin);
        assert!("bogus".parse::<Strategy>().is_err());
    }
}
