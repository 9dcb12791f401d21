//! Reachability check run before anything is written to the target.
//!
//! The probe fails closed: only a refused connection counts as "no server".
//! Timeouts, unreachable networks, handshake failures and query errors all
//! mean the target state is unknown, and the migration must not proceed.

use super::{ServerEndpoint, TargetLocation, server};
use crate::error::{MigrateError, MigrateResult};
use serde::Serialize;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Default timeout for the TCP probe and for the listing query, in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;

/// What the probe found. Every variant is safe to proceed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    /// Embedded mode, no network target. Nothing was probed.
    NoTarget,
    /// Connection refused: nothing listens on the port.
    NoServer,
    /// The server already hosts the expected database (idempotent re-run).
    DatabaseExists,
    /// The server is up and the database will be created.
    DatabaseAbsent,
}

impl Reachability {
    pub fn describe(&self) -> &'static str {
        match self {
            Reachability::NoTarget => "no network target (embedded)",
            Reachability::NoServer => "no server listening",
            Reachability::DatabaseExists => "database already exists on server",
            Reachability::DatabaseAbsent => "server reachable, database will be created",
        }
    }
}

/// Probe the location and decide whether writing to it is safe.
///
/// Returns `UNVERIFIABLE_TARGET` whenever the outcome is ambiguous.
pub async fn verify_target(
    location: &TargetLocation,
    expected_db: &str,
    probe_timeout: Duration,
) -> MigrateResult<Reachability> {
    match location {
        TargetLocation::Embedded { .. } => Ok(Reachability::NoTarget),
        TargetLocation::Server(endpoint) => verify_endpoint(endpoint, expected_db, probe_timeout).await,
    }
}

/// Probe a server endpoint. Port 0 means no network target and does no I/O.
pub async fn verify_endpoint(
    endpoint: &ServerEndpoint,
    expected_db: &str,
    probe_timeout: Duration,
) -> MigrateResult<Reachability> {
    if endpoint.port == 0 {
        return Ok(Reachability::NoTarget);
    }

    let addr = (endpoint.host.as_str(), endpoint.port);
    match timeout(probe_timeout, TcpStream::connect(addr)).await {
        Err(_) => {
            return Err(MigrateError::unverifiable_target(
                endpoint,
                format!("connect timed out after {:?}", probe_timeout),
            ));
        }
        Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
            info!(%endpoint, "no server listening on target port");
            return Ok(Reachability::NoServer);
        }
        Ok(Err(e)) => return Err(MigrateError::unverifiable_target(endpoint, e)),
        Ok(Ok(stream)) => drop(stream),
    }

    debug!(%endpoint, "port is open, listing databases");
    let databases = match timeout(probe_timeout, server::list_databases(endpoint)).await {
        Err(_) => {
            return Err(MigrateError::unverifiable_target(
                endpoint,
                format!("SHOW DATABASES timed out after {:?}", probe_timeout),
            ));
        }
        Ok(Err(e)) => return Err(MigrateError::unverifiable_target(endpoint, e)),
        Ok(Ok(databases)) => databases,
    };

    let reachability = classify_databases(&databases, expected_db);
    if reachability == Reachability::DatabaseExists {
        info!(%endpoint, database = expected_db, "target database already exists");
    }
    Ok(reachability)
}

/// Decide from a `SHOW DATABASES` listing whether the expected database exists.
/// Names compare case-insensitively.
pub fn classify_databases(databases: &[String], expected_db: &str) -> Reachability {
    if databases.iter().any(|db| db.eq_ignore_ascii_case(expected_db)) {
        Reachability::DatabaseExists
    } else {
        Reachability::DatabaseAbsent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn endpoint(port: u16) -> ServerEndpoint {
        ServerEndpoint {
            host: "127.0.0.1".to_string(),
            port,
            user: "root".to_string(),
            password: None,
        }
    }

    #[tokio::test]
    async fn test_port_zero_is_no_target() {
        let result = verify_endpoint(&endpoint(0), "proj", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(result, Reachability::NoTarget);
    }

    #[tokio::test]
    async fn test_free_port_is_no_server() {
        // Bind then drop to find a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = verify_endpoint(&endpoint(port), "proj", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result, Reachability::NoServer);
    }

    #[tokio::test]
    async fn test_non_mysql_listener_fails_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket
                    .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
                    .await;
            }
        });

        let err = verify_endpoint(&endpoint(port), "proj", Duration::from_millis(500))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnverifiableTarget);
    }

    #[tokio::test]
    async fn test_connect_timeout_fails_closed() {
        // TEST-NET-1 is never routed; the connect either hangs or errors.
        let endpoint = ServerEndpoint {
            host: "192.0.2.1".to_string(),
            ..endpoint(3307)
        };
        let err = verify_endpoint(&endpoint, "proj", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnverifiableTarget);
    }

    #[tokio::test]
    async fn test_silent_listener_fails_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let err = verify_endpoint(&endpoint(port), "proj", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnverifiableTarget);
    }

    #[test]
    fn test_listing_with_expected_database() {
        let listing = vec![
            "information_schema".to_string(),
            "Proj".to_string(),
            "mysql".to_string(),
        ];
        assert_eq!(classify_databases(&listing, "proj"), Reachability::DatabaseExists);
    }

    #[test]
    fn test_listing_without_expected_database() {
        let listing = vec!["information_schema".to_string(), "other".to_string()];
        assert_eq!(classify_databases(&listing, "proj"), Reachability::DatabaseAbsent);
        assert_eq!(classify_databases(&[], "proj"), Reachability::DatabaseAbsent);
    }

    #[tokio::test]
    async fn test_embedded_location_is_no_target() {
        let location = TargetLocation::Embedded {
            path: "/nonexistent/proj.db".into(),
        };
        let result = verify_target(&location, "proj", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(result, Reachability::NoTarget);
    }
}
