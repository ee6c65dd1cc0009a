//! Full-stack pg-wire test: a raw protocol client connects over TCP,
//! authenticates with workspace credentials, and exercises workspace
//! isolation against real engine files.

use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use cellar_core::{Bucket, ColumnDef, Layout, Stage};
use cellar_engine::{Engine, SnapshotCodec};
use cellar_pgwire::{serve, PgServerConfig, SessionLimits};
use cellar_registry::Registry;

/// Minimal blocking pg-wire client for the tests.
struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    async fn connect(addr: SocketAddr, user: &str, database: &str, password: &str) -> TestClient {
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let mut body = Vec::new();
        body.extend_from_slice(&196_608i32.to_be_bytes());
        for (k, v) in [("user", user), ("database", database)] {
            body.extend_from_slice(k.as_bytes());
            body.push(0);
            body.extend_from_slice(v.as_bytes());
            body.push(0);
        }
        body.push(0);
        let mut packet = Vec::new();
        packet.extend_from_slice(&((body.len() as i32 + 4).to_be_bytes()));
        packet.extend_from_slice(&body);
        stream.write_all(&packet).await.unwrap();

        // AuthenticationCleartextPassword
        let (tag, payload) = read_message(&mut stream).await;
        assert_eq!(tag, b'R');
        assert_eq!(i32::from_be_bytes(payload[..4].try_into().unwrap()), 3);

        let mut pw = Vec::from(password.as_bytes());
        pw.push(0);
        let mut msg = vec![b'p'];
        msg.extend_from_slice(&((pw.len() as i32 + 4).to_be_bytes()));
        msg.extend_from_slice(&pw);
        stream.write_all(&msg).await.unwrap();

        let mut client = TestClient { stream };
        // Drain until ReadyForQuery.
        loop {
            let (tag, payload) = read_message(&mut client.stream).await;
            match tag {
                b'Z' => break,
                b'E' => panic!("auth failed: {}", String::from_utf8_lossy(&payload)),
                _ => {}
            }
        }
        client
    }

    /// Send a simple query; collect (data_rows, error_messages) until
    /// ReadyForQuery.
    async fn query(&mut self, sql: &str) -> (Vec<Vec<Option<String>>>, Vec<String>) {
        let mut body = Vec::from(sql.as_bytes());
        body.push(0);
        let mut msg = vec![b'Q'];
        msg.extend_from_slice(&((body.len() as i32 + 4).to_be_bytes()));
        msg.extend_from_slice(&body);
        self.stream.write_all(&msg).await.unwrap();

        let mut rows = Vec::new();
        let mut errors = Vec::new();
        loop {
            let (tag, payload) = read_message(&mut self.stream).await;
            match tag {
                b'D' => rows.push(parse_data_row(&payload)),
                b'E' => errors.push(String::from_utf8_lossy(&payload).to_string()),
                b'Z' => break,
                _ => {}
            }
        }
        (rows, errors)
    }
}

async fn read_message(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let tag = stream.read_u8().await.unwrap();
    let len = stream.read_i32().await.unwrap();
    let mut payload = vec![0u8; (len - 4) as usize];
    stream.read_exact(&mut payload).await.unwrap();
    (tag, payload)
}

fn parse_data_row(payload: &[u8]) -> Vec<Option<String>> {
    let count = i16::from_be_bytes([payload[0], payload[1]]) as usize;
    let mut values = Vec::with_capacity(count);
    let mut pos = 2;
    for _ in 0..count {
        let len = i32::from_be_bytes(payload[pos..pos + 4].try_into().unwrap());
        pos += 4;
        if len < 0 {
            values.push(None);
        } else {
            values.push(Some(
                String::from_utf8_lossy(&payload[pos..pos + len as usize]).to_string(),
            ));
            pos += len as usize;
        }
    }
    values
}

async fn fixture() -> (tempfile::TempDir, Engine) {
    let dir = tempfile::tempdir().unwrap();
    let layout = Layout::new(dir.path());
    let registry = Registry::open(&layout.registry_path()).await.unwrap();
    registry
        .projects
        .insert(&cellar_core::Project {
            id: "p1".into(),
            name: "p1".into(),
            description: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    registry
        .buckets
        .insert(&Bucket {
            project_id: "p1".into(),
            name: "s".into(),
            stage: Stage::In,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    let engine = Engine::new(registry, layout, SnapshotCodec::Zstd);

    engine
        .create_table(
            "p1",
            "default",
            "in_c_s",
            "orders",
            vec![
                ColumnDef {
                    name: "id".into(),
                    type_name: "INTEGER".into(),
                    nullable: false,
                    default: None,
                },
                ColumnDef {
                    name: "amt".into(),
                    type_name: "DOUBLE".into(),
                    nullable: true,
                    default: None,
                },
            ],
            vec!["id".into()],
        )
        .await
        .unwrap();
    for (id, amt) in [(1, 10.0), (2, 20.0), (3, 30.0), (4, 40.0)] {
        let mut row = serde_json::Map::new();
        row.insert("id".into(), serde_json::json!(id));
        row.insert("amt".into(), serde_json::json!(amt));
        engine
            .insert_rows("p1", "default", "in_c_s", "orders", vec![row])
            .await
            .unwrap();
    }
    (dir, engine)
}

#[tokio::test]
async fn test_session_reads_attached_tables_and_stays_isolated() {
    let (_dir, engine) = fixture().await;

    let grant = engine
        .create_workspace("p1", cellar_engine::workspace::WorkspaceOptions::default())
        .await
        .unwrap();

    let server = serve(
        engine.clone(),
        PgServerConfig::new("127.0.0.1:0".parse().unwrap()),
    )
    .await
    .unwrap();
    let addr = server.local_addr;

    let database = format!("workspace_{}", grant.workspace.id);
    let mut client = TestClient::connect(addr, &grant.username, &database, &grant.password).await;

    // Attached project table is readable.
    let (rows, errors) = client.query("SELECT COUNT(*) FROM in_c_s.orders").await;
    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(rows, vec![vec![Some("4".to_string())]]);

    // Writes to the attached table fail: the attach is read-only.
    let (_, errors) = client
        .query("INSERT INTO in_c_s.orders VALUES (99, 99)")
        .await;
    assert!(!errors.is_empty());

    // The workspace itself is freely writable.
    let (_, errors) = client.query("CREATE TABLE t AS SELECT 1 AS one").await;
    assert!(errors.is_empty(), "{errors:?}");
    let (rows, errors) = client.query("SELECT one FROM t").await;
    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(rows, vec![vec![Some("1".to_string())]]);

    // The session is recorded while connected.
    let sessions = engine
        .registry()
        .workspaces
        .sessions_for_workspace(&grant.workspace.id)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_wrong_password_fails_closed() {
    let (_dir, engine) = fixture().await;
    let grant = engine
        .create_workspace("p1", cellar_engine::workspace::WorkspaceOptions::default())
        .await
        .unwrap();

    let server = serve(
        engine.clone(),
        PgServerConfig::new("127.0.0.1:0".parse().unwrap()),
    )
    .await
    .unwrap();
    let addr = server.local_addr;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut body = Vec::new();
    body.extend_from_slice(&196_608i32.to_be_bytes());
    for (k, v) in [
        ("user", grant.username.as_str()),
        ("database", format!("workspace_{}", grant.workspace.id).as_str()),
    ] {
        body.extend_from_slice(k.as_bytes());
        body.push(0);
        body.extend_from_slice(v.as_bytes());
        body.push(0);
    }
    body.push(0);
    let mut packet = Vec::new();
    packet.extend_from_slice(&((body.len() as i32 + 4).to_be_bytes()));
    packet.extend_from_slice(&body);
    stream.write_all(&packet).await.unwrap();

    let (tag, _) = read_message(&mut stream).await;
    assert_eq!(tag, b'R');

    let mut pw = Vec::from(b"wrong-password".as_slice());
    pw.push(0);
    let mut msg = vec![b'p'];
    msg.extend_from_slice(&((pw.len() as i32 + 4).to_be_bytes()));
    msg.extend_from_slice(&pw);
    stream.write_all(&msg).await.unwrap();

    let (tag, payload) = read_message(&mut stream).await;
    assert_eq!(tag, b'E');
    assert!(String::from_utf8_lossy(&payload).contains("28P01"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_statement_timeout_ends_session() {
    let (_dir, engine) = fixture().await;
    let grant = engine
        .create_workspace("p1", cellar_engine::workspace::WorkspaceOptions::default())
        .await
        .unwrap();

    let mut config = PgServerConfig::new("127.0.0.1:0".parse().unwrap());
    config.limits = SessionLimits {
        statement_timeout: Duration::from_millis(200),
        idle_timeout: Duration::from_secs(3600),
    };
    let server = serve(engine.clone(), config).await.unwrap();
    let addr = server.local_addr;

    let database = format!("workspace_{}", grant.workspace.id);
    let mut client = TestClient::connect(addr, &grant.username, &database, &grant.password).await;

    // A hash join big enough to outlive the 200ms budget.
    let slow = "SELECT count(*) FROM range(100000000) a JOIN range(100000000) b ON a.range = b.range";
    let mut body = Vec::from(slow.as_bytes());
    body.push(0);
    let mut msg = vec![b'Q'];
    msg.extend_from_slice(&((body.len() as i32 + 4).to_be_bytes()));
    msg.extend_from_slice(&body);
    client.stream.write_all(&msg).await.unwrap();

    let (tag, payload) = read_message(&mut client.stream).await;
    assert_eq!(tag, b'E');
    assert!(String::from_utf8_lossy(&payload).contains("57014"));

    server.shutdown().await;
}
