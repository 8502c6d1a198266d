//! Liveness and readiness probes of the emulator.

use crate::backends::local::LocalBackend;
use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::fs;
use uuid::Uuid;

const PROBE_BODY: &[u8] = b"readyz";

#[derive(Serialize)]
pub struct Health {
    status: &'static str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    checks: BTreeMap<&'static str, Check>,
}

#[derive(Serialize)]
struct Check {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Check {
    fn from_result(result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self { ok: true, error: None },
            Err(error) => Self {
                ok: false,
                error: Some(error),
            },
        }
    }
}

/// `GET /healthz`. Never performs I/O.
pub async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok",
        checks: BTreeMap::new(),
    })
}

/// `GET /readyz`: 200 when the metadata database answers and the payload
/// directory is writable, 503 otherwise.
pub async fn readyz(State(backend): State<LocalBackend>) -> (StatusCode, Json<Health>) {
    let checks = BTreeMap::from([
        ("sqlite", Check::from_result(check_database(&backend).await)),
        ("disk", Check::from_result(check_payload_dir(&backend).await)),
    ]);

    let ready = checks.values().all(|check| check.ok);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = Health {
        status: if ready { "ok" } else { "error" },
        checks,
    };
    (status, Json(body))
}

async fn check_database(backend: &LocalBackend) -> Result<(), String> {
    let one: i64 = sqlx::query_scalar("SELECT 1")
        .fetch_one(&*backend.db)
        .await
        .map_err(|err| format!("query failed: {err}"))?;
    if one == 1 {
        Ok(())
    } else {
        Err(format!("unexpected result: {one}"))
    }
}

/// Round-trips a probe file through the payload directory.
async fn check_payload_dir(backend: &LocalBackend) -> Result<(), String> {
    let probe = backend.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
    fs::write(&probe, PROBE_BODY)
        .await
        .map_err(|err| format!("write {}: {err}", probe.display()))?;

    let read_back = fs::read(&probe).await;
    if let Err(err) = fs::remove_file(&probe).await {
        tracing::debug!("failed to remove readiness probe {}: {}", probe.display(), err);
    }

    match read_back {
        Ok(bytes) if bytes == PROBE_BODY => Ok(()),
        Ok(_) => Err("probe content mismatch".into()),
        Err(err) => Err(format!("read {}: {err}", probe.display())),
    }
}
