//! Sync negotiation between two peers' schemas.
//!
//! Each side forms a [`SyncOpinion`] from its own schema and the peer's
//! announced schema; the two opinions are then merged into a
//! [`SyncStrategy`] that says who converts and who checks.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::SchemaObject;
use crate::types::SchemaType;

/// One side's view of whether syncing with a peer is possible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOpinion {
    pub permit_sync: bool,
    /// The peer must convert values before they can be exchanged.
    pub require_peer_convert: bool,
    /// Values received from the peer must be checked against the local schema.
    pub check_on_receive: bool,
}

impl SyncOpinion {
    const fn new(permit_sync: bool, require_peer_convert: bool, check_on_receive: bool) -> Self {
        Self {
            permit_sync,
            require_peer_convert,
            check_on_receive,
        }
    }
}

/// The merged outcome of both sides' opinions, from the local side's view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStrategy {
    pub permit_sync: bool,
    pub convert_on_send: bool,
    pub convert_on_receive: bool,
    pub check_on_receive: bool,
}

/// Forms the local opinion given the peer's schema type tag and schema text.
#[must_use]
pub fn make_local_sync_opinion(
    local: &SchemaObject,
    remote_schema: &[u8],
    remote_type_tag: u8,
) -> SyncOpinion {
    let remote_type = SchemaType::from_tag(remote_type_tag);
    let local_type = local.schema_type();
    let opinion = if remote_type == SchemaType::Unrecognized {
        warn!(remote_type_tag, "peer announced unrecognized schema type");
        SyncOpinion::new(false, true, true)
    } else if local_type == SchemaType::None {
        SyncOpinion::new(true, false, false)
    } else if remote_type == SchemaType::None {
        SyncOpinion::new(true, false, true)
    } else if local_type != remote_type {
        warn!(local = %local_type, remote = %remote_type, "schema types differ");
        SyncOpinion::new(false, true, true)
    } else {
        match SchemaObject::parse(remote_schema) {
            Err(e) => {
                warn!(error = %e, "peer schema does not parse");
                SyncOpinion::new(false, true, true)
            }
            Ok(remote) => compare_opinion(local, &remote),
        }
    };
    debug!(?opinion, "local sync opinion");
    opinion
}

fn compare_opinion(local: &SchemaObject, remote: &SchemaObject) -> SyncOpinion {
    let compatible = |old: &SchemaObject, new: &SchemaObject| {
        old.compare_against_schema_object(new)
            .is_ok_and(|(result, _)| !result.is_incompatible())
    };
    if compatible(local, remote) {
        SyncOpinion::new(true, false, false)
    } else if compatible(remote, local) {
        SyncOpinion::new(true, false, true)
    } else {
        warn!("local and peer schemas are mutually incompatible");
        SyncOpinion::new(false, true, true)
    }
}

/// Merges the local and remote opinions.
#[must_use]
pub fn conclude_sync_strategy(local: SyncOpinion, remote: SyncOpinion) -> SyncStrategy {
    let deadlock = local.require_peer_convert && remote.require_peer_convert;
    let strategy = SyncStrategy {
        permit_sync: (local.permit_sync || remote.permit_sync) && !deadlock,
        convert_on_send: !local.require_peer_convert,
        convert_on_receive: remote.require_peer_convert,
        check_on_receive: local.check_on_receive,
    };
    debug!(?local, ?remote, ?strategy, "sync strategy concluded");
    strategy
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"{"SCHEMA_VERSION":"1.0","SCHEMA_MODE":"COMPATIBLE","SCHEMA_DEFINE":{"a":"INTEGER"}}"#;
    const GROWN: &str = r#"{"SCHEMA_VERSION":"1.0","SCHEMA_MODE":"COMPATIBLE","SCHEMA_DEFINE":{"a":"INTEGER","b":"STRING"}}"#;
    const OTHER: &str = r#"{"SCHEMA_VERSION":"1.0","SCHEMA_MODE":"COMPATIBLE","SCHEMA_DEFINE":{"z":"BOOL"}}"#;

    fn schema(text: &str) -> SchemaObject {
        SchemaObject::parse(text).unwrap()
    }

    fn json_tag() -> u8 {
        SchemaType::Json.tag()
    }

    #[test]
    fn unrecognized_remote_is_refused() {
        let opinion = make_local_sync_opinion(&schema(BASE), BASE.as_bytes(), 3);
        assert_eq!(opinion, SyncOpinion::new(false, true, true));
    }

    #[test]
    fn schema_less_sides() {
        let kv = SchemaObject::default();
        assert_eq!(
            make_local_sync_opinion(&kv, BASE.as_bytes(), json_tag()),
            SyncOpinion::new(true, false, false)
        );
        assert_eq!(
            make_local_sync_opinion(&schema(BASE), b"", SchemaType::None.tag()),
            SyncOpinion::new(true, false, true)
        );
    }

    #[test]
    fn type_mismatch_and_parse_failure_are_refused() {
        let local = schema(BASE);
        let refused = SyncOpinion::new(false, true, true);
        assert_eq!(
            make_local_sync_opinion(&local, BASE.as_bytes(), SchemaType::FlatBuffer.tag()),
            refused
        );
        assert_eq!(make_local_sync_opinion(&local, b"{", json_tag()), refused);
    }

    #[test]
    fn upgrade_direction_decides_check_on_receive() {
        // Remote is an upgrade of local.
        assert_eq!(
            make_local_sync_opinion(&schema(BASE), GROWN.as_bytes(), json_tag()),
            SyncOpinion::new(true, false, false)
        );
        // Local is an upgrade of remote.
        assert_eq!(
            make_local_sync_opinion(&schema(GROWN), BASE.as_bytes(), json_tag()),
            SyncOpinion::new(true, false, true)
        );
        assert_eq!(
            make_local_sync_opinion(&schema(BASE), OTHER.as_bytes(), json_tag()),
            SyncOpinion::new(false, true, true)
        );
    }

    #[test]
    fn both_demanding_conversion_is_refused() {
        let demand = SyncOpinion::new(true, true, false);
        assert!(!conclude_sync_strategy(demand, demand).permit_sync);
    }

    #[test]
    fn strategy_merges_opinions() {
        let local = SyncOpinion::new(true, false, true);
        let remote = SyncOpinion::new(false, true, true);
        let strategy = conclude_sync_strategy(local, remote);
        assert_eq!(
            strategy,
            SyncStrategy {
                permit_sync: true,
                convert_on_send: true,
                convert_on_receive: true,
                check_on_receive: true,
            }
        );
    }
}
