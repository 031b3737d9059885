//! Database relation provisioning

use mysql_operator::controller::{ErrorKind, Severity, concerns, handle_event};
use mysql_operator::leadership::Leadership;
use mysql_operator::relations::RequestOutcome;
use mysql_operator::relations::database::{
    DATA, DATABASE, ENDPOINTS, PASSWORD, READ_ONLY_ENDPOINTS, USERNAME, VERSION,
};
use mysql_operator::store::{
    Databag, MemorySecretStore, RelationEndpoint, RelationStore, SecretStore,
};
use mysql_operator::{Context, UnitEvent};

use crate::common::*;

async fn request_database(deployment: &TestDeployment, relation_id: u32, database: &str) {
    deployment
        .relations
        .set_remote_data(
            RelationEndpoint::Database,
            relation_id,
            databag(&[(DATABASE, database)]),
        )
        .await;
}

async fn changed(ctx: &Context, relation_id: u32) -> mysql_operator::Result<()> {
    handle_event(
        ctx,
        UnitEvent::RelationChanged {
            endpoint: RelationEndpoint::Database,
            relation_id,
        },
    )
    .await
}

async fn published(deployment: &TestDeployment, relation_id: u32) -> Databag {
    deployment
        .relations
        .local_app_data(RelationEndpoint::Database, relation_id)
        .await
        .unwrap()
}

mod request_tests {
    use super::*;

    #[tokio::test]
    async fn test_request_deferred_until_cluster_initialized() {
        let deployment = TestDeployment::new();
        let leader = deployment.unit(0, Leadership::Leader);
        request_database(&deployment, 7, "test_db").await;

        // Own instance cannot be configured yet, so there is no cluster
        deployment.admin.fail_transient("configure_instance", 2);
        changed(&leader, 7).await.unwrap();

        assert!(published(&deployment, 7).await.is_empty());
        assert_eq!(deployment.admin.count("create_scoped_user"), 0);
        let condition = leader.status.condition(concerns::DATABASE).await.unwrap();
        assert_eq!(condition.severity, Severity::Waiting);
        assert_eq!(condition.reason, "Deferred");

        changed(&leader, 7).await.unwrap();

        let data = published(&deployment, 7).await;
        assert_eq!(
            data.get(DATA).map(String::as_str),
            Some(r#"{"database": "test_db"}"#)
        );
        assert_eq!(data.get(USERNAME).map(String::as_str), Some("relation-7"));
        assert_eq!(data.get(DATABASE).map(String::as_str), Some("test_db"));
        assert_eq!(
            data.get(ENDPOINTS).map(String::as_str),
            Some("mysql-k8s-primary:3306")
        );
        assert_eq!(
            data.get(READ_ONLY_ENDPOINTS).map(String::as_str),
            Some("mysql-k8s-replicas:3306")
        );
        assert!(data.get(VERSION).unwrap().starts_with("8.0"));
        assert_eq!(
            data.get(PASSWORD).cloned(),
            deployment.admin.password("relation-7")
        );
        assert_eq!(deployment.admin.user("relation-7").as_deref(), Some("test_db"));
        assert!(leader.status.condition(concerns::DATABASE).await.is_none());
    }

    #[tokio::test]
    async fn test_repeated_passes_keep_credentials() {
        let deployment = TestDeployment::new();
        let leader = deployment.unit(0, Leadership::Leader);
        request_database(&deployment, 7, "test_db").await;

        changed(&leader, 7).await.unwrap();
        let first = published(&deployment, 7).await;
        changed(&leader, 7).await.unwrap();
        handle_event(&leader, UnitEvent::UpdateStatus).await.unwrap();

        assert_eq!(published(&deployment, 7).await, first);
        assert_eq!(deployment.admin.count("create_scoped_user"), 1);
    }

    #[tokio::test]
    async fn test_follower_defers_to_leader() {
        let deployment = TestDeployment::new();
        let leader = deployment.unit(0, Leadership::Leader);
        let follower = deployment.unit(1, Leadership::Follower);
        handle_event(&leader, UnitEvent::PeerChanged).await.unwrap();
        request_database(&deployment, 3, "orders").await;

        let outcome = follower
            .database
            .handle_request(3, Leadership::Follower, true)
            .await
            .unwrap();
        assert!(matches!(outcome, RequestOutcome::Deferred(_)));

        changed(&follower, 3).await.unwrap();
        assert!(published(&deployment, 3).await.is_empty());
        assert!(follower.status.condition(concerns::DATABASE).await.is_none());
    }

    #[tokio::test]
    async fn test_relation_without_request() {
        let deployment = TestDeployment::new();
        let leader = deployment.unit(0, Leadership::Leader);
        deployment.relations.join(RelationEndpoint::Database, 4).await;

        let outcome = leader
            .database
            .handle_request(4, Leadership::Leader, true)
            .await
            .unwrap();
        assert_eq!(outcome, RequestOutcome::NoRequest);
    }

    #[tokio::test]
    async fn test_invalid_database_name_blocks() {
        let deployment = TestDeployment::new();
        let leader = deployment.unit(0, Leadership::Leader);
        request_database(&deployment, 9, "orders; DROP DATABASE mysql").await;

        let err = changed(&leader, 9).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DataConflict);
        assert!(published(&deployment, 9).await.is_empty());
        assert_eq!(deployment.admin.count("create_scoped_user"), 0);
        let condition = leader.status.condition(concerns::DATABASE).await.unwrap();
        assert_eq!(condition.severity, Severity::Blocked);
    }

    #[tokio::test]
    async fn test_other_relations_served_despite_failure() {
        let deployment = TestDeployment::new();
        let leader = deployment.unit(0, Leadership::Leader);
        request_database(&deployment, 1, "bad name").await;
        request_database(&deployment, 2, "inventory").await;

        assert!(changed(&leader, 2).await.is_err());

        let data = published(&deployment, 2).await;
        assert_eq!(data.get(USERNAME).map(String::as_str), Some("relation-2"));
    }

    #[tokio::test]
    async fn test_changed_database_name_conflicts() {
        let deployment = TestDeployment::new();
        let leader = deployment.unit(0, Leadership::Leader);
        request_database(&deployment, 5, "first").await;
        changed(&leader, 5).await.unwrap();

        request_database(&deployment, 5, "second").await;
        let err = changed(&leader, 5).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DataConflict);
        let data = published(&deployment, 5).await;
        assert_eq!(data.get(DATABASE).map(String::as_str), Some("first"));
    }
}

mod revoke_tests {
    use super::*;

    async fn secret_keys(secrets: &MemorySecretStore) -> Vec<String> {
        SecretStore::keys(secrets).await.unwrap()
    }

    #[tokio::test]
    async fn test_broken_relation_drops_user() {
        let deployment = TestDeployment::new();
        let leader = deployment.unit(0, Leadership::Leader);
        request_database(&deployment, 7, "test_db").await;
        changed(&leader, 7).await.unwrap();
        assert!(secret_keys(&deployment.secrets).await.contains(&"relation-7".to_string()));

        deployment.relations.depart(RelationEndpoint::Database, 7).await;
        handle_event(
            &leader,
            UnitEvent::RelationBroken {
                endpoint: RelationEndpoint::Database,
                relation_id: 7,
            },
        )
        .await
        .unwrap();

        assert_eq!(deployment.admin.count("drop_scoped_user"), 1);
        assert!(deployment.admin.user("relation-7").is_none());
        assert!(!secret_keys(&deployment.secrets).await.contains(&"relation-7".to_string()));
    }

    #[tokio::test]
    async fn test_follower_does_not_revoke() {
        let deployment = TestDeployment::new();
        let leader = deployment.unit(0, Leadership::Leader);
        let follower = deployment.unit(1, Leadership::Follower);
        request_database(&deployment, 7, "test_db").await;
        changed(&leader, 7).await.unwrap();

        deployment.relations.depart(RelationEndpoint::Database, 7).await;
        handle_event(
            &follower,
            UnitEvent::RelationBroken {
                endpoint: RelationEndpoint::Database,
                relation_id: 7,
            },
        )
        .await
        .unwrap();

        assert_eq!(deployment.admin.count("drop_scoped_user"), 0);
        assert!(deployment.admin.user("relation-7").is_some());
    }

    #[tokio::test]
    async fn test_missed_break_revoked_on_later_pass() {
        let deployment = TestDeployment::new();
        let leader = deployment.unit(0, Leadership::Leader);
        request_database(&deployment, 7, "test_db").await;
        request_database(&deployment, 8, "orders").await;
        changed(&leader, 7).await.unwrap();

        // Relation 7 went away while no leader was watching
        deployment.relations.depart(RelationEndpoint::Database, 7).await;
        handle_event(&leader, UnitEvent::UpdateStatus).await.unwrap();

        assert_eq!(deployment.admin.count("drop_scoped_user"), 1);
        assert!(deployment.admin.user("relation-7").is_none());
        let keys = secret_keys(&deployment.secrets).await;
        assert!(!keys.contains(&"relation-7".to_string()));
        assert!(keys.contains(&"relation-8".to_string()));
        assert_eq!(
            leader.credentials.scoped_relation_ids().await.unwrap(),
            vec![8]
        );
    }
}
