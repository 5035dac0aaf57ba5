use std::cell::Cell;
use std::rc::Rc;

use capwire::capability::{Client, Params, Promise, Response, Results, Server};
use capwire::message::{self, HeapAllocator, ReaderOptions};
use capwire::{Error, ErrorKind};
use capwire_rpc::rpc_capnp;
use capwire_rpc::twoparty::{self, Side};
use capwire_rpc::{ConnectionPhase, RpcSystem, TableSizes};

use futures::channel::oneshot;
use futures::future::{self, Either};
use futures::{Future, FutureExt, TryFutureExt};

use std::time::Duration;

const TEST_INTERFACE: u64 = 0xb2f0_4c6e_19a3_d785;
const COUNTER_INTERFACE: u64 = 0xc1a9_7e52_80d4_3b6f;

const ECHO: u16 = 0;
const GET_COUNTER: u16 = 1;
const HANG: u16 = 2;
const HANG_STATUS: u16 = 3;
const FAIL: u16 = 4;
const ECHO_CAP: u16 = 5;

const INCREMENT: u16 = 0;

/// Counts the calls made on it and answers each with `label:count`.
struct Counter {
    label: String,
    count: u32,
}

impl Counter {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            count: 0,
        }
    }
}

impl Server for Counter {
    fn dispatch_call(
        &mut self,
        interface_id: u64,
        method_id: u16,
        _params: Params,
        mut results: Results,
    ) -> Promise<(), Error> {
        if interface_id != COUNTER_INTERFACE || method_id != INCREMENT {
            return Promise::err(Error::unimplemented(format!(
                "counter has no method {interface_id:#x}.{method_id}"
            )));
        }
        self.count += 1;
        let reply = format!("{}:{}", self.label, self.count);
        capwire::pry!(results.set(&reply[..]));
        Promise::ok(())
    }
}

struct HangGuard(Rc<Cell<u32>>);

impl Drop for HangGuard {
    fn drop(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

#[derive(Default)]
struct TestServer {
    hangs_started: Rc<Cell<u32>>,
    hangs_dropped: Rc<Cell<u32>>,
}

impl Server for TestServer {
    fn dispatch_call(
        &mut self,
        interface_id: u64,
        method_id: u16,
        params: Params,
        mut results: Results,
    ) -> Promise<(), Error> {
        if interface_id != TEST_INTERFACE {
            return Promise::err(Error::unimplemented(format!(
                "unknown interface {interface_id:#x}"
            )));
        }
        match method_id {
            ECHO => {
                let text = capwire::pry!(capwire::pry!(params.get()).get_as::<&str>());
                capwire::pry!(results.set(text));
                Promise::ok(())
            }
            GET_COUNTER => {
                let label = capwire::pry!(capwire::pry!(params.get()).get_as::<&str>());
                capwire::pry!(results.set(capwire_rpc::new_client(Counter::new(label))));
                Promise::ok(())
            }
            HANG => {
                self.hangs_started.set(self.hangs_started.get() + 1);
                let guard = HangGuard(self.hangs_dropped.clone());
                Promise::from_future(async move {
                    let _guard = guard;
                    futures::future::pending::<()>().await;
                    Ok(())
                })
            }
            HANG_STATUS => {
                let status = format!(
                    "{}:{}",
                    self.hangs_started.get(),
                    self.hangs_dropped.get()
                );
                capwire::pry!(results.set(&status[..]));
                Promise::ok(())
            }
            FAIL => Promise::err(Error::failed("it failed on purpose".to_string())),
            ECHO_CAP => {
                let cap = capwire::pry!(capwire::pry!(params.get()).get_as::<Client>());
                capwire::pry!(results.set(cap));
                Promise::ok(())
            }
            _ => Promise::err(Error::unimplemented(format!("method {method_id}"))),
        }
    }
}

fn canceled_to_error(_e: oneshot::Canceled) -> Error {
    Error::failed("oneshot was canceled".to_string())
}

fn spawn<F>(spawner: &mut futures::executor::LocalSpawner, task: F)
where
    F: Future<Output = Result<(), Error>> + 'static,
{
    use futures::task::LocalSpawnExt;
    spawner
        .spawn_local(task.map(|r| {
            if let Err(e) = r {
                panic!("Error on spawned task: {e:?}");
            }
        }))
        .unwrap();
}

fn server_rpc_system(
    reader: async_byte_channel::Receiver,
    writer: async_byte_channel::Sender,
) -> RpcSystem<Side> {
    let network = Box::new(twoparty::VatNetwork::new(
        reader,
        writer,
        Side::Server,
        ReaderOptions::new(),
    ));
    RpcSystem::new(network, Some(capwire_rpc::new_client(TestServer::default())))
}

fn client_rpc_system(
    reader: async_byte_channel::Receiver,
    writer: async_byte_channel::Sender,
    options: ReaderOptions,
) -> RpcSystem<Side> {
    let network = Box::new(twoparty::VatNetwork::new(reader, writer, Side::Client, options));
    RpcSystem::new(network, None)
}

fn disconnector_setup() -> (RpcSystem<Side>, RpcSystem<Side>) {
    let ((client_reader, client_writer), (server_reader, server_writer)) =
        async_byte_channel::duplex();
    (
        client_rpc_system(client_reader, client_writer, ReaderOptions::new()),
        server_rpc_system(server_reader, server_writer),
    )
}

/// Table sizes of both ends once `main` is done and the connection has gone quiet.
struct Settled {
    client: TableSizes,
    server: TableSizes,
}

impl Settled {
    fn assert_no_calls_outstanding(&self) {
        for (side, sizes) in [("client", self.client), ("server", self.server)] {
            assert_eq!(sizes.questions, 0, "{side} questions: {sizes:?}");
            assert_eq!(sizes.answers, 0, "{side} answers: {sizes:?}");
        }
    }
}

fn rpc_top_level_with_options<F, G>(client_options: ReaderOptions, main: F) -> Settled
where
    F: FnOnce(Client) -> G,
    G: Future<Output = Result<(), Error>> + 'static,
{
    let mut pool = futures::executor::LocalPool::new();
    let mut spawner = pool.spawner();
    let ((client_reader, client_writer), (server_reader, server_writer)) =
        async_byte_channel::duplex();

    let server_system = server_rpc_system(server_reader, server_writer);
    let server_monitor = server_system.get_monitor();
    spawn(&mut spawner, server_system);

    let mut rpc_system = client_rpc_system(client_reader, client_writer, client_options);
    let client: Client = rpc_system.bootstrap(Side::Server);
    let disconnector = rpc_system.get_disconnector();
    let client_monitor = rpc_system.get_monitor();
    spawn(&mut spawner, rpc_system);

    pool.run_until(main(client)).unwrap();

    // Let the Finish and Release messages sent on drop reach the other side.
    pool.run_until_stalled();
    let settled = Settled {
        client: client_monitor.table_sizes().unwrap_or_default(),
        server: server_monitor.table_sizes().unwrap_or_default(),
    };

    // The spawned systems outlive `main` otherwise.
    pool.run_until(disconnector).unwrap();
    settled
}

fn rpc_top_level<F, G>(main: F) -> Settled
where
    F: FnOnce(Client) -> G,
    G: Future<Output = Result<(), Error>> + 'static,
{
    rpc_top_level_with_options(ReaderOptions::new(), main)
}

fn text_request(client: &Client, method_id: u16, text: &str) -> Promise<Response, Error> {
    let mut request = client.new_call(TEST_INTERFACE, method_id, None);
    capwire::pry!(request.set(text));
    request.send().promise
}

fn increment(counter: &Client) -> Promise<Response, Error> {
    counter.new_call(COUNTER_INTERFACE, INCREMENT, None).send().promise
}

async fn text_of(promise: Promise<Response, Error>) -> Result<String, Error> {
    let response = promise.await?;
    let text = response.get()?.get_as::<&str>()?;
    Ok(text.to_string())
}

#[test]
fn drop_rpc_system() {
    let (writer, reader) = async_byte_channel::channel();
    let rpc_system = client_rpc_system(reader, writer, ReaderOptions::new());
    drop(rpc_system);
}

#[test]
fn do_nothing() {
    rpc_top_level(|_client| async { Ok(()) });
}

#[test]
fn bootstrap_and_echo() {
    rpc_top_level(|client| async move {
        let first = text_request(&client, ECHO, "hello");
        let second = text_request(&client, ECHO, "world");
        assert_eq!(text_of(second).await?, "world");
        assert_eq!(text_of(first).await?, "hello");
        Ok(())
    })
    .assert_no_calls_outstanding();
}

#[test]
fn pipelined_calls_match_sequential_calls() {
    rpc_top_level(|client| async move {
        let mut request = client.new_call(TEST_INTERFACE, GET_COUNTER, None);
        request.set("p")?;
        let remote = request.send();
        let pipelined = Client::new(remote.pipeline.as_cap());

        // Both go out before the counter itself has come back.
        let one = increment(&pipelined);
        let two = increment(&pipelined);

        let response = remote.promise.await?;
        let counter = response.get()?.get_as::<Client>()?;
        let three = increment(&counter);

        assert_eq!(text_of(one).await?, "p:1");
        assert_eq!(text_of(two).await?, "p:2");
        assert_eq!(text_of(three).await?, "p:3");
        assert_eq!(text_of(increment(&pipelined)).await?, "p:4");
        Ok(())
    })
    .assert_no_calls_outstanding();
}

#[test]
fn calls_on_a_promise_that_resolves_locally_stay_in_order() {
    rpc_top_level(|client| async move {
        let local = capwire_rpc::new_client(Counter::new("local"));

        let mut request = client.new_call(TEST_INTERFACE, ECHO_CAP, None);
        request.set(local.clone())?;
        let remote = request.send();
        let echoed = Client::new(remote.pipeline.as_cap());

        // These travel to the server and back again.
        let call0 = increment(&echoed);
        let call1 = increment(&echoed);

        let _response = remote.promise.await?;

        // These must wait behind the first two.
        let call2 = increment(&echoed);
        let call3 = increment(&echoed);

        let replies =
            futures::future::try_join_all(vec![call0, call1, call2, call3]).await?;
        for (n, reply) in replies.iter().enumerate() {
            assert_eq!(reply.get()?.get_as::<&str>()?, format!("local:{}", n + 1));
        }
        Ok(())
    });
}

#[test]
fn dropping_a_call_cancels_the_handler() {
    rpc_top_level(|client| async move {
        let hang = client.new_call(TEST_INTERFACE, HANG, None).send();

        // A later call can finish while the first is still pending.
        assert_eq!(text_of(text_request(&client, ECHO, "sync")).await?, "sync");
        assert_eq!(text_of(text_request(&client, HANG_STATUS, "")).await?, "1:0");

        drop(hang);

        let mut attempts = 0;
        loop {
            let status = text_of(text_request(&client, HANG_STATUS, "")).await?;
            if status == "1:1" {
                break;
            }
            assert_eq!(status, "1:0");
            attempts += 1;
            assert!(attempts < 100, "the hanging handler was never dropped");
        }
        Ok(())
    });
}

#[test]
fn exceptions_come_back_as_errors() {
    rpc_top_level(|client| async move {
        match text_request(&client, FAIL, "").await {
            Err(ref e) if e.kind == ErrorKind::Failed => {
                assert!(e.extra.contains("it failed on purpose"), "{e}");
            }
            Err(e) => panic!("wrong kind of error: {e:?}"),
            Ok(_) => panic!("expected the call to fail"),
        }

        match text_request(&client, 77, "").await {
            Err(ref e) if e.kind == ErrorKind::Unimplemented => (),
            Err(e) => panic!("wrong kind of error: {e:?}"),
            Ok(_) => panic!("expected the call to fail"),
        }

        // The connection survives both.
        assert_eq!(text_of(text_request(&client, ECHO, "still here")).await?, "still here");
        Ok(())
    });
}

#[test]
fn oversized_requests_fail_before_sending() {
    let mut options = ReaderOptions::new();
    options.traversal_limit_in_words(256);
    rpc_top_level_with_options(options, |client| async move {
        let big = "x".repeat(4096);
        match text_request(&client, ECHO, &big).await {
            Err(ref e) if e.kind == ErrorKind::MessageTooLarge => (),
            Err(e) => panic!("wrong kind of error: {e:?}"),
            Ok(_) => panic!("expected the request to be rejected"),
        }
        assert_eq!(text_of(text_request(&client, ECHO, "small")).await?, "small");
        Ok(())
    });
}

#[test]
fn calls_after_disconnect_fail() {
    let mut pool = futures::executor::LocalPool::new();
    let mut spawner = pool.spawner();
    let (mut client_rpc_system, server_rpc_system) = disconnector_setup();

    let client: Client = client_rpc_system.bootstrap(Side::Server);

    spawn(&mut spawner, client_rpc_system);

    let (tx, rx) = oneshot::channel::<()>();
    let rx = rx.map_err(canceled_to_error);
    spawn(
        &mut spawner,
        futures::future::try_join(rx, server_rpc_system).map(|_| Ok(())),
    );

    pool.run_until(async move {
        text_of(text_request(&client, ECHO, "before")).await.unwrap();
        drop(tx);

        match text_request(&client, ECHO, "after").await {
            Err(ref e) if e.kind == ErrorKind::Disconnected => (),
            Err(e) => panic!("wrong kind of error: {e:?}"),
            Ok(_) => panic!("Should have gotten a 'disconnected' error."),
        }

        // A second attempt takes the already-disconnected path.
        match text_request(&client, ECHO, "again").await {
            Err(ref e) if e.kind == ErrorKind::Disconnected => (),
            _ => panic!("Should have gotten a 'disconnected' error."),
        }

        drop(client);
    });
}

#[test]
fn disconnector_disconnects() {
    let mut pool = futures::executor::LocalPool::new();
    let mut spawner = pool.spawner();
    let (mut client_rpc_system, server_rpc_system) = disconnector_setup();

    let client: Client = client_rpc_system.bootstrap(Side::Server);
    let disconnector = client_rpc_system.get_disconnector();

    spawn(&mut spawner, client_rpc_system);

    let (tx, rx) = oneshot::channel::<()>();

    // Fires when the server side shuts down.
    spawn(
        &mut spawner,
        server_rpc_system.map(|r| {
            let _ = tx.send(());
            r
        }),
    );

    pool.run_until(async move {
        text_of(text_request(&client, ECHO, "hi")).await.unwrap();

        disconnector.await.unwrap();

        match text_request(&client, ECHO, "bye").await {
            Err(ref e) if e.kind == ErrorKind::Disconnected => (),
            Err(e) => panic!("wrong kind of error: {e:?}"),
            Ok(_) => panic!("Should have gotten a 'disconnected' error."),
        }

        rx.await.unwrap();
    });
}

#[test]
fn connection_phase_follows_the_lifecycle() {
    let mut pool = futures::executor::LocalPool::new();
    let mut spawner = pool.spawner();
    let (mut rpc_system, server_rpc_system) = disconnector_setup();
    spawn(&mut spawner, server_rpc_system);

    assert_eq!(rpc_system.connection_phase(), None);
    let client: Client = rpc_system.bootstrap(Side::Server);
    assert_eq!(rpc_system.connection_phase(), Some(ConnectionPhase::Connecting));

    let echoed = pool.run_until(async {
        match futures::future::select(&mut rpc_system, text_request(&client, ECHO, "up")).await {
            futures::future::Either::Left((r, _)) => panic!("rpc system ended early: {r:?}"),
            futures::future::Either::Right((response, _)) => response,
        }
    });
    assert_eq!(echoed.unwrap().get().unwrap().get_as::<&str>().unwrap(), "up");
    assert_eq!(rpc_system.connection_phase(), Some(ConnectionPhase::Established));

    let mut disconnector = rpc_system.get_disconnector();
    assert!((&mut disconnector).now_or_never().is_none());
    assert_eq!(rpc_system.connection_phase(), Some(ConnectionPhase::Closing));

    let _ = pool.run_until(futures::future::select(&mut rpc_system, disconnector));
    assert_eq!(rpc_system.connection_phase(), None);
}

async fn read_rpc_message(
    reader: &mut async_byte_channel::Receiver,
) -> message::Reader<capwire::serialize::OwnedSegments> {
    capwire_futures::serialize::read_message(reader, ReaderOptions::new())
        .await
        .unwrap()
}

/// A Return whose results are a single capability hosted by the sender under `export_id`.
fn return_with_cap(answer_id: u32, export_id: u32) -> message::Builder<HeapAllocator> {
    let mut builder = message::Builder::new_default();
    {
        let root = builder.init_root::<rpc_capnp::message::Builder>().unwrap();
        let mut ret = root.init_return().unwrap();
        ret.set_answer_id(answer_id);
        let mut results = ret.init_results().unwrap();
        results
            .reborrow()
            .get_content()
            .set_as_capability(capwire_rpc::new_client(Counter::new("raw")).hook);
        results.init_cap_table(1).unwrap().get(0).set_sender_hosted(export_id);
    }
    builder
}

#[test]
fn late_return_after_cancel_is_discarded() {
    let mut pool = futures::executor::LocalPool::new();
    let mut spawner = pool.spawner();
    let ((client_reader, client_writer), (mut raw_reader, mut raw_writer)) =
        async_byte_channel::duplex();

    let mut rpc_system = client_rpc_system(client_reader, client_writer, ReaderOptions::new());
    let client: Client = rpc_system.bootstrap(Side::Server);
    spawn(&mut spawner, rpc_system);

    pool.run_until(async move {
        let incoming = read_rpc_message(&mut raw_reader).await;
        let root: rpc_capnp::message::Reader = incoming.get_root().unwrap();
        let rpc_capnp::message::Which::Bootstrap(bootstrap) = root.which().unwrap() else {
            panic!("expected bootstrap, got {}", root.kind_name());
        };
        assert_eq!(bootstrap.unwrap().get_question_id(), 0);

        let remote = {
            let mut request = client.new_call(TEST_INTERFACE, ECHO, None);
            request.set("never answered").unwrap();
            request.send()
        };

        let incoming = read_rpc_message(&mut raw_reader).await;
        let root: rpc_capnp::message::Reader = incoming.get_root().unwrap();
        let rpc_capnp::message::Which::Call(call) = root.which().unwrap() else {
            panic!("expected call, got {}", root.kind_name());
        };
        let call = call.unwrap();
        assert_eq!(call.get_question_id(), 1);
        let rpc_capnp::message_target::Which::PromisedAnswer(promised) =
            call.get_target().unwrap().which().unwrap()
        else {
            panic!("expected a call on the bootstrap promise");
        };
        assert_eq!(promised.unwrap().get_question_id(), 0);

        drop(remote);
        assert_eq!(expect_finish(&mut raw_reader).await, (1, true));

        // The answer to the canceled call crosses the Finish on the wire.
        capwire_futures::serialize::write_message(&mut raw_writer, &return_with_cap(1, 9))
            .await
            .unwrap();
        capwire_futures::serialize::write_message(&mut raw_writer, &return_with_cap(0, 7))
            .await
            .unwrap();

        client.when_resolved().await.unwrap();

        // Export 9 was never imported, so there is no Release for it.
        assert_eq!(expect_finish(&mut raw_reader).await, (0, false));

        let _remote = {
            let mut request = client.new_call(TEST_INTERFACE, ECHO, None);
            request.set("to the import").unwrap();
            request.send()
        };

        let incoming = read_rpc_message(&mut raw_reader).await;
        let root: rpc_capnp::message::Reader = incoming.get_root().unwrap();
        let rpc_capnp::message::Which::Call(call) = root.which().unwrap() else {
            panic!("expected call, got {}", root.kind_name());
        };
        let call = call.unwrap();
        // Both earlier question ids are free again.
        assert_eq!(call.get_question_id(), 0);
        let rpc_capnp::message_target::Which::ImportedCap(import_id) =
            call.get_target().unwrap().which().unwrap()
        else {
            panic!("expected a call on the imported capability");
        };
        assert_eq!(import_id, 7);
    });
}

/// Resolves once `after` has passed on the wall clock.
fn deadline(after: Duration) -> oneshot::Receiver<()> {
    let (expire, expired) = oneshot::channel();
    std::thread::spawn(move || {
        std::thread::sleep(after);
        let _ = expire.send(());
    });
    expired
}

async fn expect_finish(reader: &mut async_byte_channel::Receiver) -> (u32, bool) {
    let incoming = read_rpc_message(reader).await;
    let root: rpc_capnp::message::Reader = incoming.get_root().unwrap();
    let rpc_capnp::message::Which::Finish(finish) = root.which().unwrap() else {
        panic!("expected finish, got {}", root.kind_name());
    };
    let finish = finish.unwrap();
    (finish.get_question_id(), finish.get_release_result_caps())
}

#[test]
fn call_abandoned_at_its_deadline_is_finished() {
    let mut pool = futures::executor::LocalPool::new();
    let mut spawner = pool.spawner();
    let ((client_reader, client_writer), (mut raw_reader, mut raw_writer)) =
        async_byte_channel::duplex();

    let mut rpc_system = client_rpc_system(client_reader, client_writer, ReaderOptions::new());
    let client: Client = rpc_system.bootstrap(Side::Server);
    let monitor = rpc_system.get_monitor();
    spawn(&mut spawner, rpc_system);

    pool.run_until(async move {
        let incoming = read_rpc_message(&mut raw_reader).await;
        let root: rpc_capnp::message::Reader = incoming.get_root().unwrap();
        assert!(matches!(
            root.which().unwrap(),
            rpc_capnp::message::Which::Bootstrap(_)
        ));

        // The peer never answers, so the deadline always wins.
        let capwire::capability::RemotePromise { promise, pipeline } = {
            let mut request = client.new_call(TEST_INTERFACE, ECHO, None);
            request.set("too slow").unwrap();
            request.send()
        };
        drop(pipeline);
        match future::select(promise, deadline(Duration::from_millis(20))).await {
            Either::Left((result, _)) => {
                panic!("call completed without an answer: {:?}", result.err())
            }
            Either::Right((_, abandoned)) => drop(abandoned),
        }

        assert_eq!(expect_finish(&mut raw_reader).await, (1, true));
        assert_eq!(monitor.table_sizes().unwrap().questions, 2);

        capwire_futures::serialize::write_message(&mut raw_writer, &return_with_cap(1, 9))
            .await
            .unwrap();
        capwire_futures::serialize::write_message(&mut raw_writer, &return_with_cap(0, 7))
            .await
            .unwrap();
        client.when_resolved().await.unwrap();

        assert_eq!(expect_finish(&mut raw_reader).await, (0, false));
        // Only the bootstrap capability was imported; the late Return left nothing behind.
        let sizes = monitor.table_sizes().unwrap();
        assert_eq!(sizes.questions, 0);
        assert_eq!(sizes.imports, 1);
    });
}
