//! Peer key space updates shared between units

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{TimeZone, Utc};

use mysql_operator::leadership::Leadership;
use mysql_operator::peer::record::{ADDRESS, DEPARTING, MEMBER_STATE};
use mysql_operator::peer::{PeerState, RestoreMarker, TopologyUpdate};
use mysql_operator::store::MemoryPeerStore;

use crate::common::unit_name;

fn peer(store: &MemoryPeerStore, ordinal: u32) -> PeerState {
    PeerState::new(Arc::new(store.clone()), &unit_name(ordinal))
}

fn members(ordinals: &[u32]) -> BTreeSet<String> {
    ordinals.iter().map(|ordinal| unit_name(*ordinal)).collect()
}

async fn publish_ready(state: &PeerState) {
    state
        .update_unit(&[
            (ADDRESS, Some(format!("{}.endpoints", state.unit()))),
            (MEMBER_STATE, Some("ready".to_string())),
        ])
        .await
        .unwrap();
}

mod counter_tests {
    use super::*;

    #[tokio::test]
    async fn test_counter_survives_reinitialization() {
        let store = MemoryPeerStore::new();
        let leader = peer(&store, 0);
        let token = Leadership::Leader.token().unwrap();
        leader
            .update_topology(
                &token,
                &[TopologyUpdate::Adopted {
                    cluster_name: "cluster".into(),
                    members: members(&[0, 1, 2]),
                }],
            )
            .await
            .unwrap();

        let record = leader
            .update_topology(
                &token,
                &[
                    TopologyUpdate::RestoreFinished,
                    TopologyUpdate::ClusterCreated {
                        cluster_name: "cluster".into(),
                        unit: unit_name(0),
                    },
                ],
            )
            .await
            .unwrap();

        assert!(record.cluster_initialized);
        assert_eq!(record.members, members(&[0]));
        assert_eq!(record.units_added_to_cluster, 3);
    }

    #[tokio::test]
    async fn test_adopting_smaller_cluster_keeps_counter() {
        let store = MemoryPeerStore::new();
        let leader = peer(&store, 0);
        let token = Leadership::Leader.token().unwrap();
        for ordinal in 0..4 {
            leader
                .update_topology(
                    &token,
                    &[TopologyUpdate::MemberAdded {
                        unit: unit_name(ordinal),
                    }],
                )
                .await
                .unwrap();
        }

        let record = leader
            .update_topology(
                &token,
                &[TopologyUpdate::Adopted {
                    cluster_name: "cluster".into(),
                    members: members(&[0, 1]),
                }],
            )
            .await
            .unwrap();

        assert_eq!(record.units_added_to_cluster, 4);
        assert_eq!(record.members, members(&[0, 1]));
    }
}

mod removal_tests {
    use super::*;

    #[tokio::test]
    async fn test_departing_unit_entries_dropped_on_removal() {
        let store = MemoryPeerStore::new();
        let leader = peer(&store, 0);
        let departing = peer(&store, 1);
        let token = Leadership::Leader.token().unwrap();
        publish_ready(&departing).await;
        leader
            .update_topology(
                &token,
                &[TopologyUpdate::MemberAdded { unit: unit_name(1) }],
            )
            .await
            .unwrap();
        departing
            .update_unit(&[(DEPARTING, Some("true".to_string()))])
            .await
            .unwrap();

        let record = leader
            .update_topology(
                &token,
                &[TopologyUpdate::MemberRemoved { unit: unit_name(1) }],
            )
            .await
            .unwrap();

        assert!(record.unit(&unit_name(1)).is_none());
        assert!(!record.members.contains(&unit_name(1)));
        assert_eq!(record.units_added_to_cluster, 1);
    }

    #[tokio::test]
    async fn test_removed_unit_keeps_entries_unless_departing() {
        let store = MemoryPeerStore::new();
        let leader = peer(&store, 0);
        let unit = peer(&store, 1);
        let token = Leadership::Leader.token().unwrap();
        publish_ready(&unit).await;
        leader
            .update_topology(
                &token,
                &[
                    TopologyUpdate::MemberAdded { unit: unit_name(1) },
                    TopologyUpdate::MemberRemoved { unit: unit_name(1) },
                ],
            )
            .await
            .unwrap();

        let record = leader.read().await.unwrap();
        assert!(!record.members.contains(&unit_name(1)));
        // Still ready, so it is added back by a later pass
        assert!(record.unit(&unit_name(1)).unwrap().is_ready());
    }
}

mod restore_marker_tests {
    use super::*;

    #[tokio::test]
    async fn test_marker_round_trip_and_clear() {
        let store = MemoryPeerStore::new();
        let leader = peer(&store, 0);
        let follower = peer(&store, 1);
        let token = Leadership::Leader.token().unwrap();
        let marker = RestoreMarker {
            backup_id: "2024-05-01T12-00-00Z".into(),
            unit: unit_name(0),
            started_at: Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap(),
        };
        leader
            .update_topology(
                &token,
                &[
                    TopologyUpdate::ClusterCreated {
                        cluster_name: "cluster".into(),
                        unit: unit_name(0),
                    },
                    TopologyUpdate::RestoreStarted(marker.clone()),
                ],
            )
            .await
            .unwrap();

        let seen = follower.read().await.unwrap();
        assert!(seen.is_restoring());
        assert_eq!(seen.restore, Some(marker));

        let record = leader
            .update_topology(&token, &[TopologyUpdate::RestoreFinished])
            .await
            .unwrap();
        assert!(!record.is_restoring());
        assert!(!record.cluster_initialized);
        assert!(record.members.is_empty());
        assert_eq!(record.units_added_to_cluster, 1);
    }

    #[tokio::test]
    async fn test_unchanged_update_keeps_version() {
        let store = MemoryPeerStore::new();
        let leader = peer(&store, 0);
        let token = Leadership::Leader.token().unwrap();
        let created = TopologyUpdate::ClusterCreated {
            cluster_name: "cluster".into(),
            unit: unit_name(0),
        };

        let first = leader
            .update_topology(&token, &[created.clone()])
            .await
            .unwrap();
        let second = leader.update_topology(&token, &[created]).await.unwrap();

        assert_eq!(first.version, second.version);
    }
}
