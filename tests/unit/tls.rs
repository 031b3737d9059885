//! Certificate requests and TLS installation

use mysql_operator::controller::{ErrorKind, Severity, concerns, handle_event};
use mysql_operator::leadership::Leadership;
use mysql_operator::store::{RelationEndpoint, RelationStore};
use mysql_operator::tls::{CSRS_KEY, PendingRequest};
use mysql_operator::{Context, UnitEvent};

use crate::common::*;

const RELATION_ID: u32 = 11;

struct Installed {
    ca: Vec<u8>,
    cert: Vec<u8>,
    key: Vec<u8>,
}

async fn installed_files(ctx: &Context) -> Option<Installed> {
    let read = |path: std::path::PathBuf| async move { tokio::fs::read(path).await.ok() };
    Some(Installed {
        ca: read(ctx.tls.ca_path()).await?,
        cert: read(ctx.tls.cert_path()).await?,
        key: read(ctx.tls.key_path()).await?,
    })
}

async fn relate(deployment: &TestDeployment, ctx: &Context) -> PendingRequest {
    deployment
        .relations
        .join(RelationEndpoint::Certificates, RELATION_ID)
        .await;
    handle_event(
        ctx,
        UnitEvent::RelationChanged {
            endpoint: RelationEndpoint::Certificates,
            relation_id: RELATION_ID,
        },
    )
    .await
    .unwrap();
    ctx.tls.pending_request().await.unwrap().unwrap()
}

async fn issue(deployment: &TestDeployment, authority: &TestAuthority, csr: &str, cert: String) {
    publish_certificates(
        &deployment.relations,
        RELATION_ID,
        &[authority.issued(csr, cert)],
    )
    .await;
}

async fn cert_issued(ctx: &Context) -> mysql_operator::Result<()> {
    handle_event(
        ctx,
        UnitEvent::CertIssued {
            relation_id: RELATION_ID,
        },
    )
    .await
}

/// Unit 0 with a valid certificate installed
async fn secured() -> (TestDeployment, Context, TestAuthority, PendingRequest) {
    let deployment = TestDeployment::new();
    let ctx = deployment.unit(0, Leadership::Leader);
    let authority = TestAuthority::new("test-ca");
    let pending = relate(&deployment, &ctx).await;
    let cert = authority.sign(&pending.key_pem, &[ctx.config.unit_address.as_str()]);
    issue(&deployment, &authority, &pending.csr_pem, cert).await;
    cert_issued(&ctx).await.unwrap();
    (deployment, ctx, authority, pending)
}

mod request_tests {
    use super::*;

    #[tokio::test]
    async fn test_relating_publishes_csr() {
        let deployment = TestDeployment::new();
        let ctx = deployment.unit(0, Leadership::Leader);

        let pending = relate(&deployment, &ctx).await;

        let data = ctx
            .relations
            .local_unit_data(RelationEndpoint::Certificates, RELATION_ID)
            .await
            .unwrap();
        let published = data.get(CSRS_KEY).unwrap();
        assert!(published.contains("CERTIFICATE REQUEST"));
        assert!(pending.matches(
            &serde_json::from_str::<Vec<serde_json::Value>>(published).unwrap()[0]
                ["certificate_signing_request"]
                .as_str()
                .unwrap()
        ));
        let condition = ctx.status.condition(concerns::TLS).await.unwrap();
        assert_eq!(condition.reason, "AwaitingCertificate");
        assert!(installed_files(&ctx).await.is_none());
    }

    #[tokio::test]
    async fn test_request_is_reused() {
        let deployment = TestDeployment::new();
        let ctx = deployment.unit(0, Leadership::Leader);

        let first = relate(&deployment, &ctx).await;
        let second = relate(&deployment, &ctx).await;

        assert_eq!(first, second);
    }
}

mod install_tests {
    use super::*;

    #[tokio::test]
    async fn test_valid_certificate_installed() {
        let (deployment, ctx, _authority, pending) = secured().await;

        let files = installed_files(&ctx).await.unwrap();
        assert_eq!(
            String::from_utf8(files.key).unwrap().trim(),
            pending.key_pem.trim()
        );
        assert_eq!(deployment.admin.tls_reloads(), 1);

        let digest = ctx.tls.installed_digest().await.unwrap().unwrap();
        let record = deployment.record().await;
        assert_eq!(
            record.unit(&unit_name(0)).unwrap().tls_digest.as_deref(),
            Some(digest.as_str())
        );
        let condition = ctx.status.condition(concerns::TLS).await.unwrap();
        assert_eq!(condition.severity, Severity::Active);
    }

    #[tokio::test]
    async fn test_same_certificate_not_reinstalled() {
        let (deployment, ctx, _authority, _pending) = secured().await;

        cert_issued(&ctx).await.unwrap();

        assert_eq!(deployment.admin.tls_reloads(), 1);
    }

    #[tokio::test]
    async fn test_expired_certificate_leaves_files_untouched() {
        let (deployment, ctx, authority, pending) = secured().await;
        let before = installed_files(&ctx).await.unwrap();

        let expired = authority.sign_expired(&pending.key_pem, &[ctx.config.unit_address.as_str()]);
        issue(&deployment, &authority, &pending.csr_pem, expired).await;
        let err = cert_issued(&ctx).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DataConflict);
        let after = installed_files(&ctx).await.unwrap();
        assert_eq!(before.ca, after.ca);
        assert_eq!(before.cert, after.cert);
        assert_eq!(before.key, after.key);
        assert_eq!(deployment.admin.tls_reloads(), 1);
        let condition = ctx.status.condition(concerns::TLS).await.unwrap();
        assert_eq!(condition.severity, Severity::Blocked);
    }

    #[tokio::test]
    async fn test_certificate_from_other_ca_rejected() {
        let (deployment, ctx, _authority, pending) = secured().await;
        let before = installed_files(&ctx).await.unwrap();

        // Claims to be issued by a CA that did not sign it
        let rogue = TestAuthority::new("rogue-ca");
        let other = TestAuthority::new("other-ca");
        let cert = rogue.sign(&pending.key_pem, &[ctx.config.unit_address.as_str()]);
        issue(&deployment, &other, &pending.csr_pem, cert).await;
        let err = cert_issued(&ctx).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DataConflict);
        let after = installed_files(&ctx).await.unwrap();
        assert_eq!(before.cert, after.cert);
    }

    #[tokio::test]
    async fn test_certificate_for_other_key_rejected() {
        let deployment = TestDeployment::new();
        let ctx = deployment.unit(0, Leadership::Leader);
        let authority = TestAuthority::new("test-ca");
        let pending = relate(&deployment, &ctx).await;

        let stranger = rcgen::KeyPair::generate().unwrap().serialize_pem();
        let cert = authority.sign(&stranger, &[ctx.config.unit_address.as_str()]);
        issue(&deployment, &authority, &pending.csr_pem, cert).await;
        let err = cert_issued(&ctx).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DataConflict);
        assert!(installed_files(&ctx).await.is_none());
        assert_eq!(deployment.admin.tls_reloads(), 0);
    }

    #[tokio::test]
    async fn test_failed_reload_restores_previous_files() {
        let (deployment, ctx, authority, pending) = secured().await;
        let before = installed_files(&ctx).await.unwrap();
        let digest = ctx.tls.installed_digest().await.unwrap();

        let renewed = authority.sign(&pending.key_pem, &[ctx.config.unit_address.as_str()]);
        issue(&deployment, &authority, &pending.csr_pem, renewed).await;
        deployment.admin.fail_transient("reload_tls", 2);
        assert!(cert_issued(&ctx).await.is_err());

        let after = installed_files(&ctx).await.unwrap();
        assert_eq!(before.cert, after.cert);
        assert_eq!(ctx.tls.installed_digest().await.unwrap(), digest);
        let record = deployment.record().await;
        assert_eq!(record.unit(&unit_name(0)).unwrap().tls_digest, digest);
        assert!(ctx.status.halted().await.is_none());
    }
}

mod revert_tests {
    use super::*;

    #[tokio::test]
    async fn test_broken_relation_reverts_to_engine_material() {
        let (deployment, ctx, _authority, _pending) = secured().await;

        deployment
            .relations
            .depart(RelationEndpoint::Certificates, RELATION_ID)
            .await;
        handle_event(
            &ctx,
            UnitEvent::RelationBroken {
                endpoint: RelationEndpoint::Certificates,
                relation_id: RELATION_ID,
            },
        )
        .await
        .unwrap();

        assert!(installed_files(&ctx).await.is_none());
        assert!(ctx.tls.installed_digest().await.unwrap().is_none());
        assert!(ctx.tls.pending_request().await.unwrap().is_none());
        assert_eq!(deployment.admin.tls_reloads(), 2);
        let record = deployment.record().await;
        assert!(record.unit(&unit_name(0)).unwrap().tls_digest.is_none());
        assert!(ctx.status.condition(concerns::TLS).await.is_none());
    }
}
