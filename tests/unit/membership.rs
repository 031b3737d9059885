//! Membership passes run through the event entry point

use mysql_operator::admin::{MemberRole, MemberStatus};
use mysql_operator::controller::{ErrorKind, concerns, handle_event};
use mysql_operator::leadership::Leadership;
use mysql_operator::peer::MemberState;
use mysql_operator::{Context, UnitEvent};

use crate::common::*;

async fn pass(ctx: &Context) {
    handle_event(ctx, UnitEvent::PeerChanged).await.unwrap();
}

/// Leader bootstrapped on unit 0, units 1.. joined
async fn active_deployment(units: u32) -> (TestDeployment, Vec<Context>) {
    let deployment = TestDeployment::new();
    let mut contexts = vec![deployment.unit(0, Leadership::Leader)];
    for ordinal in 1..units {
        contexts.push(deployment.unit(ordinal, Leadership::Follower));
    }
    pass(&contexts[0]).await;
    for ctx in &contexts[1..] {
        pass(ctx).await;
    }
    pass(&contexts[0]).await;
    (deployment, contexts)
}

mod bootstrap_tests {
    use super::*;

    #[tokio::test]
    async fn test_leader_bootstraps_on_own_instance() {
        let deployment = TestDeployment::new();
        let leader = deployment.unit(0, Leadership::Leader);

        pass(&leader).await;

        assert_eq!(deployment.admin.count("configure_instance"), 1);
        assert_eq!(deployment.admin.count("create_cluster"), 1);
        let record = deployment.record().await;
        assert!(record.cluster_initialized);
        assert_eq!(record.units_added_to_cluster, 1);
        assert!(record.members.contains(&unit_name(0)));
        assert_eq!(
            record.unit(&unit_name(0)).unwrap().member_state,
            MemberState::Ready
        );

        let topology = deployment.admin.topology();
        let primary = topology.primary().unwrap().unwrap();
        assert_eq!(primary.unit_id, unit_name(0));
    }

    #[tokio::test]
    async fn test_second_pass_issues_no_calls() {
        let deployment = TestDeployment::new();
        let leader = deployment.unit(0, Leadership::Leader);
        pass(&leader).await;

        deployment.admin.clear_calls();
        pass(&leader).await;

        assert!(
            deployment.admin.calls().is_empty(),
            "unexpected calls: {:?}",
            deployment.admin.calls()
        );
        assert_eq!(deployment.record().await.units_added_to_cluster, 1);
    }

    #[tokio::test]
    async fn test_follower_never_bootstraps() {
        let deployment = TestDeployment::new();
        let leader = deployment.unit(0, Leadership::Leader);
        let follower = deployment.unit(1, Leadership::Follower);

        // Credentials come from the leader; the follower only reads them
        handle_event(&follower, UnitEvent::PeerChanged).await.unwrap();
        assert_eq!(deployment.admin.count("configure_instance"), 0);
        let condition = follower.status.condition(concerns::CREDENTIALS).await.unwrap();
        assert_eq!(condition.reason, "AwaitingCredentials");

        // Credentials exist but leadership is elsewhere
        leader
            .credentials
            .ensure_system_credentials(Leadership::Leader)
            .await
            .unwrap();
        pass(&follower).await;

        assert_eq!(deployment.admin.count("configure_instance"), 1);
        assert_eq!(deployment.admin.count("create_cluster"), 0);
        let record = deployment.record().await;
        assert!(!record.cluster_initialized);
        assert!(record.unit(&unit_name(1)).unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_leader_bootstraps_on_ready_follower_when_own_instance_fails() {
        let deployment = TestDeployment::new();
        let leader = deployment.unit(0, Leadership::Leader);
        let follower = deployment.unit(1, Leadership::Follower);
        leader
            .credentials
            .ensure_system_credentials(Leadership::Leader)
            .await
            .unwrap();
        pass(&follower).await;

        deployment.admin.fail_transient("configure_instance", 2);
        pass(&leader).await;

        let record = deployment.record().await;
        assert!(record.cluster_initialized);
        assert!(record.members.contains(&unit_name(1)));
        assert!(!record.members.contains(&unit_name(0)));
        let condition = leader.status.condition(concerns::INSTANCE).await.unwrap();
        assert_eq!(condition.reason, "RetriesExhausted");
        assert!(leader.status.halted().await.is_none());
    }

    #[tokio::test]
    async fn test_live_cluster_is_adopted_without_admin_calls() {
        let deployment = TestDeployment::new();
        deployment
            .admin
            .set_topology(live_topology(&unit_name(0), &[&unit_name(1)]));
        let leader = deployment.unit(0, Leadership::Leader);

        pass(&leader).await;

        assert_eq!(deployment.admin.count("create_cluster"), 0);
        assert_eq!(deployment.admin.count("add_instance"), 0);
        let record = deployment.record().await;
        assert!(record.cluster_initialized);
        assert_eq!(record.units_added_to_cluster, 2);
        assert_eq!(record.members.len(), 2);
    }
}

mod join_tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_unit_is_added_once() {
        let deployment = TestDeployment::new();
        let leader = deployment.unit(0, Leadership::Leader);
        let follower = deployment.unit(1, Leadership::Follower);
        pass(&leader).await;
        pass(&follower).await;

        let condition = follower.status.condition(concerns::MEMBERSHIP).await.unwrap();
        assert_eq!(condition.reason, "Joining");

        pass(&leader).await;
        pass(&leader).await;

        assert_eq!(deployment.admin.count("add_instance"), 1);
        let record = deployment.record().await;
        assert_eq!(record.units_added_to_cluster, 2);
        assert!(record.members.contains(&unit_name(1)));
        assert!(deployment.admin.topology().contains(&unit_name(1)));

        pass(&follower).await;
        let condition = follower.status.condition(concerns::MEMBERSHIP).await.unwrap();
        assert_eq!(condition.reason, "Secondary");
    }

    #[tokio::test]
    async fn test_three_units_converge() {
        let (deployment, contexts) = active_deployment(3).await;

        assert_eq!(deployment.admin.count("create_cluster"), 1);
        assert_eq!(deployment.admin.count("add_instance"), 2);
        assert_eq!(deployment.admin.topology().online_count(), 3);
        let record = deployment.record().await;
        assert_eq!(record.units_added_to_cluster, 3);

        let condition = contexts[0].status.condition(concerns::MEMBERSHIP).await.unwrap();
        assert_eq!(condition.reason, "Primary");
    }

    #[tokio::test]
    async fn test_add_instance_retried_after_transient_failure() {
        let deployment = TestDeployment::new();
        let leader = deployment.unit(0, Leadership::Leader);
        let follower = deployment.unit(1, Leadership::Follower);
        pass(&leader).await;
        pass(&follower).await;

        deployment.admin.fail_transient("add_instance", 1);
        pass(&leader).await;

        assert_eq!(deployment.admin.count("add_instance"), 2);
        assert!(deployment.admin.topology().contains(&unit_name(1)));
        let record = deployment.record().await;
        assert!(record.members.contains(&unit_name(1)));
        assert_eq!(record.units_added_to_cluster, 2);
    }

    #[tokio::test]
    async fn test_lost_lease_stops_pass_after_current_operation() {
        let deployment = TestDeployment::new();
        let leader = deployment.unit(0, Leadership::Leader);
        pass(&leader).await;
        for ordinal in 1..3 {
            pass(&deployment.unit(ordinal, Leadership::Follower)).await;
        }

        deployment
            .admin
            .lose_lease_on("add_instance", &leader.leadership);
        pass(&leader).await;

        assert_eq!(leader.leadership.current(), Leadership::Follower);
        assert_eq!(deployment.admin.count("add_instance"), 1);
        let record = deployment.record().await;
        assert_eq!(record.members.len(), 2);
        assert_eq!(record.units_added_to_cluster, 2);

        // A follower pass issues nothing further
        deployment.admin.clear_calls();
        pass(&leader).await;
        assert_eq!(deployment.admin.count("add_instance"), 0);
    }
}

mod departure_tests {
    use super::*;

    #[tokio::test]
    async fn test_departing_unit_is_removed_and_counter_kept() {
        let (deployment, contexts) = active_deployment(3).await;

        handle_event(&contexts[2], UnitEvent::Departing).await.unwrap();
        assert_eq!(deployment.admin.count("remove_instance"), 0);
        pass(&contexts[0]).await;

        assert_eq!(deployment.admin.count("remove_instance"), 1);
        assert!(!deployment.admin.topology().contains(&unit_name(2)));
        let record = deployment.record().await;
        assert_eq!(record.units_added_to_cluster, 3);
        assert!(!record.members.contains(&unit_name(2)));
        assert!(record.unit(&unit_name(2)).is_none());

        // Nothing left to do
        deployment.admin.clear_calls();
        pass(&contexts[0]).await;
        assert_eq!(deployment.admin.count("remove_instance"), 0);
        assert_eq!(deployment.admin.count("add_instance"), 0);
    }

    #[tokio::test]
    async fn test_removed_departing_unit_is_not_added_back() {
        let (deployment, contexts) = active_deployment(3).await;
        handle_event(&contexts[2], UnitEvent::Departing).await.unwrap();
        pass(&contexts[0]).await;
        assert_eq!(deployment.admin.count("remove_instance"), 1);

        // Still running out its shutdown grace period
        deployment.admin.clear_calls();
        pass(&contexts[2]).await;
        handle_event(&contexts[2], UnitEvent::UpdateStatus).await.unwrap();
        pass(&contexts[0]).await;

        assert!(deployment.record().await.unit(&unit_name(2)).is_none());
        assert_eq!(deployment.admin.count("configure_instance"), 0);
        assert_eq!(deployment.admin.count("add_instance"), 0);
        assert!(!deployment.admin.topology().contains(&unit_name(2)));
    }

    #[tokio::test]
    async fn test_last_member_stays_when_departing() {
        let (deployment, contexts) = active_deployment(1).await;

        handle_event(&contexts[0], UnitEvent::Departing).await.unwrap();

        assert_eq!(deployment.admin.count("remove_instance"), 0);
        assert!(deployment.admin.topology().contains(&unit_name(0)));
    }

    #[tokio::test]
    async fn test_unreachable_member_kept_within_grace() {
        let (deployment, contexts) = active_deployment(2).await;
        deployment
            .admin
            .set_member_status(&unit_name(1), MemberRole::ReadOnly, MemberStatus::Unreachable);

        pass(&contexts[0]).await;

        assert_eq!(deployment.admin.count("remove_instance"), 0);
        assert!(deployment.admin.topology().contains(&unit_name(1)));
    }
}

mod failover_tests {
    use super::*;

    #[tokio::test]
    async fn test_new_leader_elects_primary() {
        let (deployment, _contexts) = active_deployment(3).await;
        deployment
            .admin
            .set_member_status(&unit_name(0), MemberRole::ReadOnly, MemberStatus::Offline);

        let new_leader = deployment.unit(1, Leadership::Leader);
        pass(&new_leader).await;

        assert_eq!(deployment.admin.count("elect_primary"), 1);
        let topology = deployment.admin.topology();
        let primary = topology.primary().unwrap().unwrap();
        assert_ne!(primary.unit_id, unit_name(0));
        // Heartbeat is fresh, so the old primary is not removed yet
        assert!(topology.contains(&unit_name(0)));
    }

    #[tokio::test]
    async fn test_two_primaries_halt_mutations() {
        let (deployment, contexts) = active_deployment(2).await;
        deployment
            .admin
            .set_member_status(&unit_name(1), MemberRole::ReadWrite, MemberStatus::Online);

        let err = handle_event(&contexts[0], UnitEvent::PeerChanged)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(contexts[0].status.halted().await.is_some());

        // Even once the topology is healthy again, nothing is mutated
        deployment
            .admin
            .set_member_status(&unit_name(1), MemberRole::ReadOnly, MemberStatus::Online);
        deployment.admin.clear_calls();
        let late = deployment.unit(2, Leadership::Follower);
        pass(&late).await;
        pass(&contexts[0]).await;
        assert_eq!(deployment.admin.count("add_instance"), 0);
    }
}
