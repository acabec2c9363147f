use serde::{Deserialize, Serialize};

/// The computational/communication shape of a job.
///
/// Profiles are named per workload and may be submitted dynamically by the
/// decider while a run is in progress. The serialized form is tagged by
/// `type`, matching the decider wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Profile {
    /// Sleep for a fixed number of simulated seconds.
    Delay {
        /// Duration in simulated seconds.
        delay: f64,
    },
    /// One compute amount broadcast to every machine, one communication
    /// amount broadcast to every off-diagonal pair.
    ParallelHomogeneous {
        /// Per-machine compute amount, in flops.
        cpu: f64,
        /// Pairwise communication amount, in bytes (`0` means no comm).
        com: f64,
    },
    /// Raw compute vector and communication matrix.
    Parallel {
        /// Per-machine compute amounts; one entry per required resource.
        cpu: Vec<f64>,
        /// Row-major communication matrix, one row per required resource.
        com: Vec<Vec<f64>>,
    },
    /// Homogeneous profile with an extra hop to the parallel filesystem
    /// machine: every job host sends `size` bytes to the PFS host.
    ParallelHomogeneousPfs {
        /// Bytes sent from each job host to the PFS host.
        size: f64,
    },
    /// Replay of per-rank MPI time-independent traces.
    MpiReplay {
        /// One trace file path per rank.
        trace_files: Vec<String>,
    },
    /// Ordered list of sub-profiles, repeated `repeat` times.
    Sequence {
        /// Number of times the whole list is played.
        repeat: u32,
        /// Names of the sub-profiles, in play order.
        sequence: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_delay() {
        let p: Profile = serde_json::from_str(r#"{"type": "delay", "delay": 10.0}"#).unwrap();
        assert_eq!(p, Profile::Delay { delay: 10.0 });
    }

    #[test]
    fn parses_parallel_homogeneous() {
        let p: Profile =
            serde_json::from_str(r#"{"type": "parallel_homogeneous", "cpu": 1e6, "com": 0.0}"#)
                .unwrap();
        assert_eq!(
            p,
            Profile::ParallelHomogeneous {
                cpu: 1e6,
                com: 0.0
            }
        );
    }

    #[test]
    fn parses_sequence() {
        let p: Profile = serde_json::from_str(
            r#"{"type": "sequence", "repeat": 3, "sequence": ["a", "b"]}"#,
        )
        .unwrap();
        assert_eq!(
            p,
            Profile::Sequence {
                repeat: 3,
                sequence: vec!["a".into(), "b".into()]
            }
        );
    }

    #[test]
    fn rejects_unknown_profile_type() {
        assert!(serde_json::from_str::<Profile>(r#"{"type": "warp_drive"}"#).is_err());
    }
}
