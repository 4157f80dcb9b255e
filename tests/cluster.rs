//! End-to-end cluster tests: a registry, two storage nodes, an auth node, a
//! processing node and a routing node, all on loopback addresses, driven
//! through a plain TCP FTP client.
//!
//! Each test runs its own cluster on a private port pair so the tests can
//! run concurrently.

use libdftp::auth::AuthNode;
use libdftp::cluster::RegistryNode;
use libdftp::options::NodeConfig;
use libdftp::processing::ProcessingNode;
use libdftp::routing::RoutingNode;
use libdftp::storage::StorageNode;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;

const SUBNET: &str = "127.0.0.0/29";

const REGISTRY_IP: &str = "127.0.0.1";
const DATA1_IP: &str = "127.0.0.2";
const DATA2_IP: &str = "127.0.0.3";
const AUTH_IP: &str = "127.0.0.4";
const PROC_IP: &str = "127.0.0.5";
const ROUTING_IP: &str = "127.0.0.6";

fn config(name: &str, ip: &str, control_port: u16) -> NodeConfig {
    let mut cfg = NodeConfig::with_subnet(name, ip.parse().unwrap(), SUBNET.parse().unwrap()).control_port(control_port);
    // speed convergence up for the test
    cfg.heartbeat_interval = Duration::from_millis(500);
    cfg
}

struct Cluster {
    ftp_port: u16,
    data1_root: PathBuf,
    data2_root: PathBuf,
    _dirs: Vec<tempfile::TempDir>,
}

async fn start_cluster(control_port: u16, ftp_port: u16) -> Cluster {
    let auth_dir = tempfile::tempdir().unwrap();
    let data1_dir = tempfile::tempdir().unwrap();
    let data2_dir = tempfile::tempdir().unwrap();
    let data1_root = data1_dir.path().join("root");
    let data2_root = data2_dir.path().join("root");

    let registry = RegistryNode::new(config("registry-1", REGISTRY_IP, control_port));
    tokio::spawn(async move { registry.serve().await });

    let storage1 = StorageNode::new(config("data-1", DATA1_IP, control_port), &data1_root).await.unwrap();
    tokio::spawn(async move { storage1.serve().await });
    let storage2 = StorageNode::new(config("data-2", DATA2_IP, control_port), &data2_root).await.unwrap();
    tokio::spawn(async move { storage2.serve().await });

    let auth = AuthNode::new(config("auth-1", AUTH_IP, control_port), auth_dir.path().join("users.json"))
        .await
        .unwrap();
    tokio::spawn(async move { auth.serve().await });

    let processing = ProcessingNode::new(config("proc-1", PROC_IP, control_port));
    tokio::spawn(async move { processing.serve().await });

    let routing = RoutingNode::new(config("routing-1", ROUTING_IP, control_port), ftp_port);
    tokio::spawn(async move { routing.serve().await });

    Cluster {
        ftp_port,
        data1_root,
        data2_root,
        _dirs: vec![auth_dir, data1_dir, data2_dir],
    }
}

struct FtpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl FtpClient {
    async fn connect(ftp_port: u16) -> std::io::Result<Self> {
        let addr: IpAddr = ROUTING_IP.parse().unwrap();
        let stream = TcpStream::connect((addr, ftp_port)).await?;
        let (read_half, writer) = stream.into_split();
        Ok(FtpClient {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    async fn read_reply(&mut self) -> (u16, String) {
        let mut line = String::new();
        let deadline = Duration::from_secs(30);
        tokio::time::timeout(deadline, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a reply")
            .expect("control connection closed");
        let line = line.trim_end().to_string();
        let code = line[..3].parse().expect("reply must start with a code");
        (code, line)
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
    }

    async fn cmd(&mut self, line: &str) -> (u16, String) {
        self.send(line).await;
        self.read_reply().await
    }
}

/// Parses `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2).`
fn parse_pasv(reply: &str) -> (IpAddr, u16) {
    let open = reply.find('(').unwrap();
    let close = reply.rfind(')').unwrap();
    let parts: Vec<u16> = reply[open + 1..close].split(',').map(|p| p.parse().unwrap()).collect();
    assert_eq!(parts.len(), 6, "malformed PASV reply: {reply}");
    let ip: IpAddr = format!("{}.{}.{}.{}", parts[0], parts[1], parts[2], parts[3]).parse().unwrap();
    (ip, parts[4] * 256 + parts[5])
}

/// Keeps trying to log in until discovery has converged.
async fn connect_when_ready(ftp_port: u16) -> FtpClient {
    for _ in 0..60 {
        if let Ok(mut client) = FtpClient::connect(ftp_port).await {
            let (code, _) = client.read_reply().await;
            assert_eq!(code, 220);
            let (code, _) = client.cmd("USER test").await;
            if code == 331 {
                let (code, _) = client.cmd("PASS test123").await;
                assert_eq!(code, 230);
                return client;
            }
            // discovery has not settled yet; the routing node may even have
            // closed the session after a 421
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("cluster did not become ready in time");
}

async fn wait_for_file(root: &Path, rel: &str, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::fs::try_exists(root.join(rel)).await.unwrap_or(false) {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_session_against_a_live_cluster() {
    let cluster = start_cluster(18300, 12121).await;
    let mut client = connect_when_ready(cluster.ftp_port).await;

    // basic session commands
    let (code, line) = client.cmd("PWD").await;
    assert_eq!(code, 257, "{line}");
    let (code, _) = client.cmd("SYST").await;
    assert_eq!(code, 215);
    let (code, _) = client.cmd("TYPE I").await;
    assert_eq!(code, 200);
    let (code, _) = client.cmd("NOOP").await;
    assert_eq!(code, 200);

    // directory setup
    let (code, line) = client.cmd("MKD docs").await;
    assert_eq!(code, 257, "{line}");
    let (code, line) = client.cmd("CWD docs").await;
    assert_eq!(code, 250, "{line}");
    assert!(line.contains("/docs"));

    // upload via PASV
    let payload: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
    let (code, line) = client.cmd("PASV").await;
    assert_eq!(code, 227, "{line}");
    let (data_ip, data_port) = parse_pasv(&line);
    let mut data = TcpStream::connect((data_ip, data_port)).await.unwrap();

    client.send("STOR hello.bin").await;
    let (code, line) = client.read_reply().await;
    assert_eq!(code, 150, "{line}");
    data.write_all(&payload).await.unwrap();
    data.shutdown().await.unwrap();
    drop(data);
    let (code, line) = client.read_reply().await;
    assert_eq!(code, 226, "{line}");
    assert!(line.contains("hello.bin"));

    // the file must land on the PASV primary, and replication must carry
    // it to the other storage node
    let on_primary = wait_for_file(&cluster.data1_root, "test/docs/hello.bin", Duration::from_secs(10)).await;
    let on_replica = wait_for_file(&cluster.data2_root, "test/docs/hello.bin", Duration::from_secs(10)).await;
    assert!(on_primary || on_replica, "stored file is on neither storage node");
    assert!(on_primary && on_replica, "stored file was not replicated to the peer");

    // download and compare
    let (code, line) = client.cmd("PASV").await;
    assert_eq!(code, 227, "{line}");
    let (data_ip, data_port) = parse_pasv(&line);
    let mut data = TcpStream::connect((data_ip, data_port)).await.unwrap();

    client.send("RETR hello.bin").await;
    let (code, line) = client.read_reply().await;
    assert_eq!(code, 150, "{line}");
    let mut downloaded = Vec::new();
    data.read_to_end(&mut downloaded).await.unwrap();
    let (code, line) = client.read_reply().await;
    assert_eq!(code, 226, "{line}");
    assert_eq!(downloaded, payload, "RETR must return the exact bytes STOR uploaded");

    // listing shows the file
    let (code, line) = client.cmd("PASV").await;
    assert_eq!(code, 227, "{line}");
    let (data_ip, data_port) = parse_pasv(&line);
    let mut data = TcpStream::connect((data_ip, data_port)).await.unwrap();

    client.send("LIST").await;
    let (code, _) = client.read_reply().await;
    assert_eq!(code, 150);
    let mut listing = String::new();
    data.read_to_string(&mut listing).await.unwrap();
    let (code, _) = client.read_reply().await;
    assert_eq!(code, 226);
    assert!(listing.contains("hello.bin"), "LIST output was: {listing:?}");

    // failure boundaries
    let (code, _) = client.cmd("DELE ghost.bin").await;
    assert_eq!(code, 550);
    let (code, _) = client.cmd("RNTO other.bin").await;
    assert_eq!(code, 503);
    let (code, _) = client.cmd("RETR ../../etc/passwd").await;
    assert_eq!(code, 550);

    // rename round trip
    let (code, _) = client.cmd("RNFR hello.bin").await;
    assert_eq!(code, 350);
    let (code, line) = client.cmd("RNTO hello2.bin").await;
    assert_eq!(code, 250, "{line}");
    let (code, _) = client.cmd("DELE hello2.bin").await;
    assert_eq!(code, 250);

    // empty directory teardown
    let (code, _) = client.cmd("CDUP").await;
    assert_eq!(code, 250);
    let (code, line) = client.cmd("RMD docs").await;
    assert_eq!(code, 250, "{line}");

    let (code, _) = client.cmd("QUIT").await;
    assert_eq!(code, 221);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn login_failures_are_530() {
    let cluster = start_cluster(18400, 12221).await;
    // wait until the cluster serves logins at all
    let warmup = connect_when_ready(cluster.ftp_port).await;
    drop(warmup);

    let mut client = FtpClient::connect(cluster.ftp_port).await.unwrap();
    let (code, _) = client.read_reply().await;
    assert_eq!(code, 220);

    let (code, _) = client.cmd("USER nobody").await;
    assert_eq!(code, 530);

    let (code, _) = client.cmd("USER test").await;
    assert_eq!(code, 331);
    let (code, _) = client.cmd("PASS wrong").await;
    assert_eq!(code, 530);

    // commands before login are refused
    let (code, _) = client.cmd("PWD").await;
    assert_eq!(code, 530);

    // PASS without USER is out of sequence
    let (code, _) = client.cmd("REIN").await;
    assert_eq!(code, 220);
    let (code, _) = client.cmd("PASS whatever").await;
    assert_eq!(code, 503);

    let (code, _) = client.cmd("QUIT").await;
    assert_eq!(code, 221);
}
