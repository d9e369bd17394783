//! JSON bodies of the parameter server's HTTP surface.
//!
//! Statistics travel as `[s0, s1, s2, n_abnormal]`; maps are keyed by the
//! decimal function id.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::stats::RunStats;

/// `POST /update` request and response, `POST /stat/{id}` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatMessage {
    pub id: u64,
    pub stat: RunStats,
}

/// `POST /update_all` request and response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsMessage {
    pub stats: HashMap<u64, RunStats>,
}

/// `POST /stat` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PsSnapshot {
    pub ps: HashMap<u64, RunStats>,
}

/// `POST /add_abnormal` request and response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbnormalMessage {
    pub id: u64,
    pub abnormal: u64,
}

/// `POST /add_abnormal_all` request and response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbnormalsMessage {
    pub abnormals: HashMap<u64, u64>,
}

/// `POST /clear` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// `POST /dump` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpResponse {
    pub path: PathBuf,
    pub functions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_body_shape() {
        let body: StatMessage =
            serde_json::from_str(r#"{"id":12,"stat":[3e-6,1.5,0.75,0]}"#).expect("parse");
        assert_eq!(body.id, 12);
        assert_eq!(body.stat.count(), (3, 0));
        assert_eq!(body.stat.s1(), 1.5);
    }

    #[test]
    fn test_maps_keyed_by_decimal_id() {
        let msg = AbnormalsMessage {
            abnormals: HashMap::from([(42, 3)]),
        };
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json, serde_json::json!({"abnormals": {"42": 3}}));

        let back: AbnormalsMessage = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, msg);
    }
}
