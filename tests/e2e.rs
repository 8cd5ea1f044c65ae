use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use may::{coroutine, go};

use geerpc::{
    heartbeat, Client, CodecType, Discovery, Error, MultiServersDiscovery, Options, Registry,
    RegistryDiscovery, SelectMode, Server, ServerInstance, Service, XClient,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Foo;

fn foo_service() -> Service {
    Service::build("Foo", Foo)
        .method("Sum", |_: &Foo, (a, b): (i32, i32), reply: &mut i32| {
            *reply = a + b;
            Ok(())
        })
        .method("Sleep", |_: &Foo, millis: u64, reply: &mut u64| {
            coroutine::sleep(Duration::from_millis(millis));
            *reply = millis;
            Ok(())
        })
        .finish()
}

fn start_foo_server() -> ServerInstance {
    let server = Server::new();
    server.register(foo_service()).unwrap();
    server.start("127.0.0.1:0").unwrap()
}

#[test]
fn call_sums_over_tcp() {
    init_logs();
    let instance = start_foo_server();
    let client = Client::dial(instance.local_addr().unwrap()).unwrap();
    let sum: i32 = client.call("Foo.Sum", &(1, 2)).unwrap();
    assert_eq!(sum, 3);
}

#[test]
fn many_coroutines_share_one_client() {
    init_logs();
    let instance = start_foo_server();
    let client = Arc::new(Client::dial(instance.local_addr().unwrap()).unwrap());

    let mut handles = Vec::new();
    for i in 0..20i32 {
        let client = client.clone();
        handles.push(go!(move || {
            let sum: i32 = client.call("Foo.Sum", &(i, i)).unwrap();
            assert_eq!(sum, i + i);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn unknown_method_fails_without_poisoning_the_connection() {
    init_logs();
    let instance = start_foo_server();
    let client = Client::dial(instance.local_addr().unwrap()).unwrap();

    let err = client.call::<_, i32>("Foo.Nope", &(1, 2)).unwrap_err();
    assert!(err.to_string().contains("can't find method Nope"), "{err}");

    let err = client.call::<_, i32>("Bar.Sum", &(1, 2)).unwrap_err();
    assert!(err.to_string().contains("can't find service Bar"), "{err}");

    let err = client.call::<_, i32>("NoDot", &(1, 2)).unwrap_err();
    assert!(err.to_string().contains("ill-formed"), "{err}");

    // the bodies of the failed requests were consumed, framing is intact
    let sum: i32 = client.call("Foo.Sum", &(1, 2)).unwrap();
    assert_eq!(sum, 3);
}

#[test]
fn server_handle_timeout_answers_early_and_keeps_the_connection() {
    init_logs();
    let instance = start_foo_server();
    let mut opt = Options::default();
    opt.handle_timeout = Duration::from_millis(50);
    let client = Client::dial_with(instance.local_addr().unwrap(), opt).unwrap();

    let start = Instant::now();
    let err = client.call::<_, u64>("Foo.Sleep", &500u64).unwrap_err();
    assert!(
        err.to_string()
            .contains("request handle timeout: expect within 50ms"),
        "{err}"
    );
    assert!(start.elapsed() < Duration::from_millis(400));

    // the timed-out request spent its response slot; the connection lives on
    let sum: i32 = client.call("Foo.Sum", &(1, 2)).unwrap();
    assert_eq!(sum, 3);
}

#[test]
fn zero_handle_timeout_lets_slow_requests_finish() {
    init_logs();
    let instance = start_foo_server();
    let client = Client::dial(instance.local_addr().unwrap()).unwrap();
    let slept: u64 = client.call("Foo.Sleep", &80u64).unwrap();
    assert_eq!(slept, 80);
}

#[test]
fn caller_cancellation_leaves_the_connection_usable() {
    init_logs();
    let instance = start_foo_server();
    let client = Client::dial(instance.local_addr().unwrap()).unwrap();

    let start = Instant::now();
    let err = client
        .call_timeout::<_, u64>("Foo.Sleep", &500u64, Duration::from_millis(10))
        .unwrap_err();
    assert!(matches!(err, Error::Canceled), "{err}");
    assert!(start.elapsed() < Duration::from_millis(200));
    assert!(client.is_available());

    // the late response for the abandoned seq is discarded cleanly and
    // new calls keep working
    let sum: i32 = client.call("Foo.Sum", &(1, 2)).unwrap();
    assert_eq!(sum, 3);
    std::thread::sleep(Duration::from_millis(600));
    let sum: i32 = client.call("Foo.Sum", &(2, 3)).unwrap();
    assert_eq!(sum, 5);
}

#[test]
fn server_death_fails_all_outstanding_calls() {
    init_logs();
    let instance = start_foo_server();
    let client = Client::dial(instance.local_addr().unwrap()).unwrap();

    let first = client.go("Foo.Sleep", &2000u64).unwrap();
    let second = client.go("Foo.Sleep", &2000u64).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    drop(instance); // kill the server mid-flight

    assert!(first.wait::<u64>().is_err());
    assert!(second.wait::<u64>().is_err());
    assert!(!client.is_available());
    assert!(matches!(client.close(), Err(Error::Shutdown)));
    assert!(matches!(
        client.call::<_, i32>("Foo.Sum", &(1, 2)),
        Err(Error::Shutdown)
    ));
}

#[test]
fn close_makes_the_client_unavailable() {
    init_logs();
    let instance = start_foo_server();
    let client = Client::dial(instance.local_addr().unwrap()).unwrap();
    let sum: i32 = client.call("Foo.Sum", &(1, 2)).unwrap();
    assert_eq!(sum, 3);

    client.close().unwrap();
    assert!(!client.is_available());
    assert!(matches!(client.close(), Err(Error::Shutdown)));
    assert!(matches!(
        client.call::<_, i32>("Foo.Sum", &(1, 2)),
        Err(Error::Shutdown)
    ));
}

#[test]
fn json_codec_end_to_end() {
    init_logs();
    let instance = start_foo_server();
    let client = Client::dial_with(
        instance.local_addr().unwrap(),
        Options::with_codec(CodecType::Json),
    )
    .unwrap();
    let sum: i32 = client.call("Foo.Sum", &(3, 4)).unwrap();
    assert_eq!(sum, 7);
}

#[test]
fn http_connect_upgrade_end_to_end() {
    init_logs();
    let server = Server::new();
    server.register(foo_service()).unwrap();
    let instance = server.start_http("127.0.0.1:0").unwrap();

    let client = Client::dial_http(instance.local_addr().unwrap()).unwrap();
    let sum: i32 = client.call("Foo.Sum", &(20, 22)).unwrap();
    assert_eq!(sum, 42);
}

#[test]
fn http_endpoint_rejects_non_connect() {
    init_logs();
    let server = Server::new();
    server.register(foo_service()).unwrap();
    let instance = server.start_http("127.0.0.1:0").unwrap();

    let mut stream = std::net::TcpStream::connect(instance.local_addr().unwrap()).unwrap();
    stream
        .write_all(b"GET /_geerpc_ HTTP/1.0\r\n\r\n")
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.0 405"), "{response}");
    assert!(response.contains("405 must CONNECT"), "{response}");
}

#[test]
fn debug_page_lists_services_and_counts() {
    init_logs();
    let server = Server::new();
    server.register(foo_service()).unwrap();
    let instance = server.start_http("127.0.0.1:0").unwrap();
    let addr = instance.local_addr().unwrap();

    let client = Client::dial_http(addr).unwrap();
    let _: i32 = client.call("Foo.Sum", &(1, 2)).unwrap();

    let mut stream = std::net::TcpStream::connect(addr).unwrap();
    stream
        .write_all(b"GET /debug/geerpc HTTP/1.0\r\n\r\n")
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.0 200"), "{response}");
    assert!(response.contains("Foo.Sum: 1 calls"), "{response}");
}

#[cfg(unix)]
#[test]
fn unix_socket_end_to_end() {
    init_logs();
    let path = std::env::temp_dir().join(format!("geerpc-e2e-{}.sock", std::process::id()));
    let server = Server::new();
    server.register(foo_service()).unwrap();
    let _instance = server.start_unix(&path).unwrap();

    let client = Client::dial_unix(&path).unwrap();
    let sum: i32 = client.call("Foo.Sum", &(5, 6)).unwrap();
    assert_eq!(sum, 11);
}

struct Stage {
    delay: Duration,
    result: std::result::Result<i32, String>,
}

fn staged_server(delay_ms: u64, result: std::result::Result<i32, String>) -> (ServerInstance, String) {
    let server = Server::new();
    let stage = Stage {
        delay: Duration::from_millis(delay_ms),
        result,
    };
    let service = Service::build("Stage", stage)
        .method("Get", |s: &Stage, (): (), reply: &mut i32| {
            if !s.delay.is_zero() {
                coroutine::sleep(s.delay);
            }
            match &s.result {
                Ok(value) => {
                    *reply = *value;
                    Ok(())
                }
                Err(msg) => Err(Error::Status(msg.clone())),
            }
        })
        .finish();
    server.register(service).unwrap();
    let instance = server.start("127.0.0.1:0").unwrap();
    let addr = format!("tcp@{}", instance.local_addr().unwrap());
    (instance, addr)
}

#[test]
fn xclient_balances_calls_over_servers() {
    init_logs();
    let instances: Vec<ServerInstance> = (0..3).map(|_| start_foo_server()).collect();
    let addrs: Vec<String> = instances
        .iter()
        .map(|i| format!("tcp@{}", i.local_addr().unwrap()))
        .collect();

    let xc = XClient::new(
        MultiServersDiscovery::new(addrs),
        SelectMode::RoundRobin,
        Options::default(),
    );
    for i in 0..6i32 {
        let sum: i32 = xc.call("Foo.Sum", &(i, 1)).unwrap();
        assert_eq!(sum, i + 1);
    }
    xc.close();
}

#[test]
fn broadcast_returns_first_success_and_masks_errors() {
    init_logs();
    let (_i1, a1) = staged_server(100, Err("stage a failed".to_owned()));
    let (_i2, a2) = staged_server(0, Ok(7));
    let (_i3, a3) = staged_server(500, Ok(42));

    let xc = XClient::new(
        MultiServersDiscovery::new(vec![a1, a2, a3]),
        SelectMode::RoundRobin,
        Options::default(),
    );
    let start = Instant::now();
    let got: i32 = xc.broadcast("Stage.Get", &()).unwrap();
    assert_eq!(got, 7);
    // the slow sibling was abandoned on the first error instead of awaited
    assert!(start.elapsed() < Duration::from_millis(400));
}

#[test]
fn broadcast_returns_the_first_error_when_nobody_succeeds() {
    init_logs();
    let (_i1, a1) = staged_server(0, Err("first failure".to_owned()));
    let (_i2, a2) = staged_server(300, Err("late failure".to_owned()));

    let xc = XClient::new(
        MultiServersDiscovery::new(vec![a1, a2]),
        SelectMode::RoundRobin,
        Options::default(),
    );
    let err = xc.broadcast::<_, i32>("Stage.Get", &()).unwrap_err();
    assert!(err.to_string().contains("first failure"), "{err}");
}

#[test]
fn broadcast_over_an_empty_set_has_no_servers() {
    init_logs();
    let xc = XClient::new(
        MultiServersDiscovery::new(Vec::new()),
        SelectMode::Random,
        Options::default(),
    );
    assert!(matches!(
        xc.broadcast::<_, i32>("Foo.Sum", &(1, 2)),
        Err(Error::NoAvailableServers)
    ));
    assert!(matches!(
        xc.call::<_, i32>("Foo.Sum", &(1, 2)),
        Err(Error::NoAvailableServers)
    ));
}

#[test]
fn registry_lifecycle_with_heartbeats() {
    init_logs();
    let registry = Registry::new(Duration::from_secs(2));
    let registry_instance = registry.start("127.0.0.1:0").unwrap();
    let registry_url = format!(
        "http://{}{}",
        registry_instance.local_addr().unwrap(),
        geerpc::DEFAULT_REGISTRY_PATH
    );

    let instance = start_foo_server();
    let addr = format!("tcp@{}", instance.local_addr().unwrap());
    let beats = heartbeat(&registry_url, &addr, Duration::from_millis(500)).unwrap();

    std::thread::sleep(Duration::from_millis(800));
    let discovery = RegistryDiscovery::new(registry_url.clone(), Duration::from_millis(100));
    assert_eq!(discovery.get_all().unwrap(), vec![addr.clone()]);

    // calls flow end-to-end through the registry-backed discovery
    let xc = XClient::new(discovery, SelectMode::Random, Options::default());
    let sum: i32 = xc.call("Foo.Sum", &(1, 2)).unwrap();
    assert_eq!(sum, 3);

    drop(beats); // stop heartbeating; the entry must age out
    std::thread::sleep(Duration::from_millis(2600));
    let discovery = RegistryDiscovery::new(registry_url, Duration::from_millis(100));
    assert_eq!(discovery.get_all().unwrap(), Vec::<String>::new());
}
