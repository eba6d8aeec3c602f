//! End-to-end tests: a live topology on an ephemeral port, driven by a
//! plain blocking TCP client speaking the frame format.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use shardkv_core::Sga;
use shardkv_queue::framing::{encode_frame, FRAME_HEADER_LEN};
use shardkv_server::{
    launch, register_peers, KvStore, NetWorker, Policy, StoreWorker, Topology, Worker,
};

struct TestServer {
    topology: Topology,
    addr: SocketAddrV4,
}

impl TestServer {
    fn boot(seed: &[&str], workers: u32, policy: Policy) -> Self {
        let store = if seed.is_empty() {
            Arc::new(KvStore::load(None))
        } else {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            for line in seed {
                writeln!(file, "{line}").unwrap();
            }
            Arc::new(KvStore::load(Some(file.path())))
        };

        let mut net = NetWorker::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), policy, None);
        let bound = net.bound_addr();

        let mut store_workers: Vec<StoreWorker> = (1..=workers)
            .map(|id| StoreWorker::new(id, Arc::clone(&store)))
            .collect();
        for worker in &mut store_workers {
            register_peers(net.core_mut(), worker.core_mut());
        }

        let mut topology = Topology::new();
        topology.add(launch(net).unwrap());
        for worker in store_workers {
            topology.add(launch(worker).unwrap());
        }

        // launch() returns only after setup, so the address is known.
        let addr = *bound.get().expect("listener bound during setup");
        Self { topology, addr }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.topology.stop_all();
        self.topology.join_all().unwrap();
    }
}

fn send_request(stream: &mut TcpStream, text: &[u8]) {
    let sga = Sga::from_segment(Bytes::copy_from_slice(text));
    stream.write_all(&encode_frame(&sga)).unwrap();
}

fn read_reply(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut header).unwrap();
    let payload_len = u64::from_le_bytes(header[8..16].try_into().unwrap()) as usize;
    let num_segs = u64::from_le_bytes(header[16..24].try_into().unwrap()) as usize;

    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).unwrap();

    let mut body = Vec::new();
    let mut pos = 0;
    for _ in 0..num_segs {
        let seg_len = u64::from_le_bytes(payload[pos..pos + 8].try_into().unwrap()) as usize;
        pos += 8;
        body.extend_from_slice(&payload[pos..pos + seg_len]);
        pos += seg_len;
    }
    body
}

fn request_reply(stream: &mut TcpStream, text: &[u8]) -> Vec<u8> {
    send_request(stream, text);
    read_reply(stream)
}

#[test]
fn test_get_seeded_value() {
    let server = TestServer::boot(&["PUT foo bar"], 1, Policy::RoundRobin);
    let mut client = server.connect();
    assert_eq!(request_reply(&mut client, b"GET foo"), b"bar");
}

#[test]
fn test_get_missing_key() {
    let server = TestServer::boot(&[], 1, Policy::RoundRobin);
    let mut client = server.connect();
    assert_eq!(
        request_reply(&mut client, b"GET missing"),
        b"ERR: Bad key missing"
    );
}

#[test]
fn test_key_policy_two_workers() {
    // '3' after the space routes to peer index 3 mod 2 = 1; the reply
    // must come back regardless of which worker held the shard.
    let server = TestServer::boot(&["PUT 3abc hello"], 2, Policy::FirstKeyDigit);
    let mut client = server.connect();
    assert_eq!(request_reply(&mut client, b"GET 3abc"), b"hello");
    assert_eq!(request_reply(&mut client, b"GET 2abc"), b"ERR: Bad key 2abc");
}

#[test]
fn test_round_robin_two_workers() {
    let server = TestServer::boot(&["PUT a 1", "PUT b 2"], 2, Policy::RoundRobin);
    let mut client = server.connect();
    // Successive requests fan out over both workers and both answer.
    assert_eq!(request_reply(&mut client, b"GET a"), b"1");
    assert_eq!(request_reply(&mut client, b"GET b"), b"2");
    assert_eq!(request_reply(&mut client, b"GET a"), b"1");
    assert_eq!(request_reply(&mut client, b"GET b"), b"2");
}

#[test]
fn test_pipelined_requests_answered_in_order() {
    let server = TestServer::boot(&["PUT a 1", "PUT b 2", "PUT c 3"], 1, Policy::RoundRobin);
    let mut client = server.connect();
    send_request(&mut client, b"GET a");
    send_request(&mut client, b"GET b");
    send_request(&mut client, b"GET c");
    assert_eq!(read_reply(&mut client), b"1");
    assert_eq!(read_reply(&mut client), b"2");
    assert_eq!(read_reply(&mut client), b"3");
}

#[test]
fn test_bad_magic_closes_connection_but_not_the_server() {
    let server = TestServer::boot(&["PUT foo bar"], 1, Policy::RoundRobin);

    let mut broken = server.connect();
    let mut frame = encode_frame(&Sga::from_segment(Bytes::from_static(b"GET foo")));
    frame[0] ^= 0xFF;
    broken.write_all(&frame).unwrap();

    // The server drops the connection: the next read hits EOF (or a
    // reset, depending on timing).
    let mut buf = [0u8; 1];
    let eof = match broken.read(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(_) => true,
    };
    assert!(eof, "connection with a corrupt frame should be closed");

    // Other clients continue to be served.
    let mut healthy = server.connect();
    assert_eq!(request_reply(&mut healthy, b"GET foo"), b"bar");
}

#[test]
fn test_split_frame_delivery_matches_atomic_send() {
    let server = TestServer::boot(&["PUT foo bar"], 1, Policy::RoundRobin);
    let mut client = server.connect();

    let frame = encode_frame(&Sga::from_segment(Bytes::from_static(b"GET foo")));
    // First 16 bytes (a partial header), a pause, then the rest.
    client.write_all(&frame[..16]).unwrap();
    client.flush().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    client.write_all(&frame[16..]).unwrap();

    assert_eq!(read_reply(&mut client), b"bar");
}

#[test]
fn test_several_connections_interleaved() {
    let server = TestServer::boot(&["PUT shared value"], 2, Policy::RoundRobin);
    let mut first = server.connect();
    let mut second = server.connect();

    send_request(&mut first, b"GET shared");
    send_request(&mut second, b"GET shared");
    assert_eq!(read_reply(&mut second), b"value");
    assert_eq!(read_reply(&mut first), b"value");
}

#[test]
fn test_shutdown_joins_all_workers() {
    let server = TestServer::boot(&["PUT foo bar"], 4, Policy::RoundRobin);
    let mut client = server.connect();
    assert_eq!(request_reply(&mut client, b"GET foo"), b"bar");
    drop(client);
    // Drop stops and joins the whole topology; a hung worker would
    // hang the test here.
    drop(server);
}
