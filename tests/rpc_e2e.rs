//! End-to-end client/server RPC behaviour over loopback.

mod common;

use common::{init_logging, wait_until};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};
use wirecall::rpc::interface::MethodDescriptor;
use wirecall::{
    register_context_type, rpc_interface, select, timeout, wire_struct, ClientConnection,
    ClientOptions, Context, Endpoint, ErrorKind, Server, ServerOptions,
};

wire_struct! {
    /// Correlates a call with what the server observed.
    pub struct CallTag {
        pub tag: String,
    }
}

rpc_interface! {
    /// The test service: echoes, sums, and sleeps.
    pub trait Echo as EchoProxy {
        fn echo(text: String) -> String;
        fn sum(values: Vec<u32>) -> u64;
        fn sleep_ms(delay: u64) -> String;
    }
}

/// What the sleep handler saw when it was interrupted.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Interruption {
    tag: String,
    cancelled: bool,
}

struct EchoImpl {
    interruptions: Arc<Mutex<Vec<Interruption>>>,
}

impl Echo for EchoImpl {
    fn echo(&self, _ctx: &Context, text: String) -> wirecall::Result<String> {
        Ok(text)
    }

    fn sum(&self, _ctx: &Context, values: Vec<u32>) -> wirecall::Result<u64> {
        Ok(values.iter().map(|v| u64::from(*v)).sum())
    }

    fn sleep_ms(&self, ctx: &Context, delay: u64) -> wirecall::Result<String> {
        match select((timeout(Duration::from_millis(delay)),)) {
            Ok(_) => Ok("slept".to_string()),
            Err(e) => {
                self.interruptions
                    .lock()
                    .unwrap()
                    .push(Interruption {
                        tag: ctx.get::<CallTag>().tag,
                        cancelled: ctx.is_cancelled(),
                    });
                Err(e)
            }
        }
    }
}

fn register_wire_types() {
    static ONCE: Once = Once::new();
    ONCE.call_once(register_context_type::<CallTag>);
}

struct Fixture {
    server: Option<Server>,
    interruptions: Arc<Mutex<Vec<Interruption>>>,
    endpoint: Endpoint,
}

impl Fixture {
    fn start() -> Self {
        init_logging();
        register_wire_types();
        let interruptions = Arc::new(Mutex::new(Vec::new()));
        let server = Server::bind(
            Endpoint::new("127.0.0.1", "0").passive(),
            ServerOptions::default(),
        )
        .unwrap();
        EchoProxy::register(
            &server,
            "echo-service",
            Arc::new(EchoImpl {
                interruptions: Arc::clone(&interruptions),
            }),
        )
        .unwrap();
        let endpoint = Endpoint::new("127.0.0.1", server.local_addr().port().to_string());
        Self {
            server: Some(server),
            interruptions,
            endpoint,
        }
    }

    fn client(&self, options: ClientOptions) -> ClientConnection {
        ClientConnection::new(self.endpoint.clone(), options).unwrap()
    }
}

#[test]
fn echo_round_trip_leaves_no_pending_entries() {
    let fixture = Fixture::start();
    let client = fixture.client(ClientOptions::default());
    let proxy = EchoProxy::new(client.remote("echo-service"));

    let reply = proxy.echo("hello over the wire".to_string()).unwrap().wait().unwrap();
    assert_eq!(reply, "hello over the wire");
    assert_eq!(client.pending_requests(), 0);

    assert_eq!(proxy.sum(vec![1, 2, 3, 4]).unwrap().wait().unwrap(), 10);
    assert_eq!(client.pending_requests(), 0);
}

#[test]
fn concurrent_calls_resolve_independently() {
    let fixture = Fixture::start();
    let client = Arc::new(fixture.client(ClientOptions::default()));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let client = Arc::clone(&client);
            std::thread::spawn(move || {
                let proxy = EchoProxy::new(client.remote("echo-service"));
                let text = format!("caller-{i}");
                proxy.echo(text.clone()).unwrap().wait().unwrap() == text
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap());
    }
    assert_eq!(client.pending_requests(), 0);
}

#[test]
fn unknown_object_and_method_are_not_found() {
    let fixture = Fixture::start();
    let client = fixture.client(ClientOptions::default());

    let ghost = EchoProxy::new(client.remote("no-such-service"));
    let err = ghost.echo("x".to_string()).unwrap().wait().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let object = client.remote("echo-service");
    let bogus_method = MethodDescriptor::new("vanish", 0x1111);
    let err = object
        .call::<(String,), String>(&bogus_method, ("x".to_string(),))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn signature_hash_mismatch_is_rejected() {
    let fixture = Fixture::start();
    let client = fixture.client(ClientOptions::default());
    let object = client.remote("echo-service");

    let skewed = MethodDescriptor::new("echo", 0xBAD0_CAFE);
    let err = object
        .call::<(String,), String>(&skewed, ("x".to_string(),))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DataMismatch);
}

#[test]
fn deadlines_sweep_unanswered_requests() {
    let fixture = Fixture::start();
    let timeout_budget = Duration::from_millis(300);
    let client = fixture.client(ClientOptions {
        request_timeout: Some(timeout_budget),
        ..ClientOptions::default()
    });
    let proxy = EchoProxy::new(client.remote("echo-service"));

    let started = Instant::now();
    let calls: Vec<_> = (0..3)
        .map(|_| proxy.sleep_ms(60_000).unwrap())
        .collect();
    for call in calls {
        let err = call.wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= timeout_budget, "expired early after {elapsed:?}");
    assert!(
        elapsed < timeout_budget + Duration::from_millis(700),
        "sweep lagged: {elapsed:?}"
    );

    assert_eq!(client.pending_requests(), 0);
    assert!(client.is_connected(), "transport should survive timeouts");
}

#[test]
fn cancelling_a_call_reaches_the_server_with_its_tag() {
    let fixture = Fixture::start();
    let client = fixture.client(ClientOptions {
        request_timeout: None,
        ..ClientOptions::default()
    });
    let proxy = EchoProxy::new(client.remote("echo-service"));

    // The tag travels in the call context's data bag.
    let ctx = Context::child_of_current().unwrap();
    ctx.set(CallTag {
        tag: "cancel-me-7".to_string(),
    });
    let call = {
        let _scope = ctx.enter();
        proxy.sleep_ms(60_000).unwrap()
    };

    // Give the request time to reach its handler, then abandon it.
    std::thread::sleep(Duration::from_millis(150));
    call.cancel();
    let err = call.wait().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(client.pending_requests(), 0);

    let interruptions = Arc::clone(&fixture.interruptions);
    assert!(
        wait_until(Duration::from_secs(2), || {
            interruptions
                .lock()
                .unwrap()
                .iter()
                .any(|i| i.tag == "cancel-me-7" && i.cancelled)
        }),
        "server never observed the cancellation"
    );
}

#[test]
fn transport_failure_fans_out_to_every_pending_call() {
    let mut fixture = Fixture::start();
    let client = fixture.client(ClientOptions {
        request_timeout: None,
        ..ClientOptions::default()
    });
    let proxy = EchoProxy::new(client.remote("echo-service"));

    let calls: Vec<_> = (0..3)
        .map(|_| proxy.sleep_ms(60_000).unwrap())
        .collect();
    assert!(wait_until(Duration::from_secs(2), || {
        client.is_connected()
    }));

    // Kill the server mid-flight.
    fixture.server.take();

    let mut kinds = Vec::new();
    for call in calls {
        kinds.push(call.wait().unwrap_err().kind());
    }
    assert_eq!(kinds.len(), 3);
    assert!(
        kinds.iter().all(|k| *k == kinds[0]),
        "calls failed differently: {kinds:?}"
    );
    assert_eq!(client.pending_requests(), 0);
    assert!(
        wait_until(Duration::from_secs(2), || !client.is_connected()),
        "ready flag was not reset"
    );
}

#[test]
fn reconnects_after_a_server_restart_without_user_action() {
    let mut fixture = Fixture::start();
    let port = fixture.endpoint.service().to_string();
    let client = fixture.client(ClientOptions::default());
    let proxy = EchoProxy::new(client.remote("echo-service"));

    assert_eq!(
        proxy.echo("before".to_string()).unwrap().wait().unwrap(),
        "before"
    );

    // Restart the server on the same port.
    fixture.server.take();
    assert!(wait_until(Duration::from_secs(2), || !client.is_connected()));
    let restarted = Server::bind(
        Endpoint::new("127.0.0.1", port).passive(),
        ServerOptions::default(),
    )
    .unwrap();
    EchoProxy::register(
        &restarted,
        "echo-service",
        Arc::new(EchoImpl {
            interruptions: Arc::clone(&fixture.interruptions),
        }),
    )
    .unwrap();

    assert_eq!(
        proxy.echo("after".to_string()).unwrap().wait().unwrap(),
        "after"
    );
}

#[test]
fn call_scope_deadline_travels_to_the_handler() {
    let fixture = Fixture::start();
    let client = fixture.client(ClientOptions {
        request_timeout: Some(Duration::from_millis(250)),
        ..ClientOptions::default()
    });
    let proxy = EchoProxy::new(client.remote("echo-service"));

    let ctx = Context::child_of_current().unwrap();
    ctx.set(CallTag {
        tag: "deadline-probe".to_string(),
    });
    let call = {
        let _scope = ctx.enter();
        proxy.sleep_ms(60_000).unwrap()
    };
    let err = call.wait().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);

    // The handler is interrupted by its own mirrored deadline (or by the
    // follow-up cancel notice), well before its 60 s sleep.
    let interruptions = Arc::clone(&fixture.interruptions);
    assert!(
        wait_until(Duration::from_secs(3), || {
            interruptions
                .lock()
                .unwrap()
                .iter()
                .any(|i| i.tag == "deadline-probe")
        }),
        "handler slept through the caller's deadline"
    );
}
