//! Tests for a client and a stub talking over real transports
//!
//! The stub is served on its own thread, the way the sandbox runtime runs it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tether_core::client::{ClientOptions, DebugClient};
use tether_core::events::{DebugEvent, ProcessState};
use tether_core::host::Protection;
use tether_core::platform::SimulatedHost;
use tether_core::stub::{ConnectionState, Stub, StubConfig};
use tether_core::types::{signal, Address, ProcessId, ThreadId};
use tether_core::DebugError;
use tether_protocol::stream::{memory_pair, TcpServer};
use tether_protocol::{Packet, SocketAddress, Transport, TransportFlags};

const PID: ProcessId = ProcessId(7);
const WAIT: Duration = Duration::from_secs(2);

fn simulated_target() -> Arc<SimulatedHost>
{
    let host = Arc::new(SimulatedHost::new(PID));
    host.map_region(Address::from(0x1000), vec![0xde, 0xad, 0xbe, 0xef], Protection::READ);
    host.map_region(Address::from(0x2000), vec![0x90; 0x10], Protection::READ_EXECUTE);
    host.map_region(Address::from(0x10000), vec![0; 0x1800], Protection::READ_WRITE);
    host.spawn_thread(ThreadId(7), vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
    host
}

fn wait_until(mut condition: impl FnMut() -> bool)
{
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

/// A stub served over an in-memory stream, and the client connected to it.
struct Fixture
{
    host: Arc<SimulatedHost>,
    stub: Arc<Stub>,
    client: DebugClient,
    shutdown: Arc<AtomicBool>,
    server: Option<JoinHandle<()>>,
}

impl Fixture
{
    fn new() -> Self
    {
        Self::with_options(StubConfig::new(PID), ClientOptions::default())
    }

    fn with_options(config: StubConfig, options: ClientOptions) -> Self
    {
        let host = simulated_target();
        let stub = Arc::new(Stub::new(host.clone(), config).unwrap());
        let shutdown = Arc::new(AtomicBool::new(false));
        let (debugger_end, target_end) = memory_pair();

        let server = {
            let stub = Arc::clone(&stub);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || {
                let mut transport = Transport::new(Box::new(target_end));
                stub.serve_connection(&mut transport, &shutdown).unwrap();
            })
        };

        Self {
            host,
            stub,
            client: DebugClient::new(debugger_end, options),
            shutdown,
            server: Some(server),
        }
    }

    fn stop_server(&mut self)
    {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(server) = self.server.take() {
            server.join().unwrap();
        }
    }
}

impl Drop for Fixture
{
    fn drop(&mut self)
    {
        self.stop_server();
    }
}

#[test]
fn test_read_memory()
{
    let mut fixture = Fixture::new();
    let bytes = fixture.client.read_memory(Address::from(0x1000), 4).unwrap();
    assert_eq!(bytes, vec![0xde, 0xad, 0xbe, 0xef]);
}

#[test]
fn test_memory_errors_are_remote()
{
    let mut fixture = Fixture::new();
    let result = fixture.client.read_memory(Address::from(0x9000), 4);
    assert!(matches!(result, Err(DebugError::Remote(0x03))));

    let result = fixture.client.write_memory(Address::from(0x9000), &[0]);
    assert!(matches!(result, Err(DebugError::Remote(0x03))));

    // The session is still usable.
    assert_eq!(fixture.client.read_memory(Address::from(0x1003), 1).unwrap(), vec![0xef]);
}

#[test]
fn test_large_transfers_are_chunked()
{
    let mut fixture = Fixture::new();
    let base = Address::from(0x10000);
    let pattern: Vec<u8> = (0..0x1800u32).map(|index| (index % 251) as u8).collect();

    fixture.client.write_memory(base, &pattern).unwrap();
    assert_eq!(fixture.host.peek(base, pattern.len()), Some(pattern.clone()));
    assert_eq!(fixture.host.flush_count(), 3);

    let read = fixture.client.read_memory(base, pattern.len()).unwrap();
    assert_eq!(read, pattern);
}

#[test]
fn test_breakpoint_patches_target()
{
    let mut fixture = Fixture::new();
    let address = Address::from(0x2000);

    assert!(fixture.client.add_breakpoint(address).unwrap());
    assert_eq!(fixture.host.peek(address, 1), Some(vec![0xcc]));
    assert_eq!(fixture.client.breakpoint(address).unwrap().original, 0x90);

    fixture.client.disable_breakpoint(address).unwrap();
    assert_eq!(fixture.host.peek(address, 1), Some(vec![0x90]));

    fixture.client.enable_breakpoint(address).unwrap();
    fixture.client.suspend_breakpoint(address).unwrap();
    assert_eq!(fixture.host.peek(address, 1), Some(vec![0x90]));
    fixture.client.resume_breakpoint(address).unwrap();
    assert_eq!(fixture.host.peek(address, 1), Some(vec![0xcc]));

    let record = fixture.client.remove_breakpoint(address).unwrap();
    assert_eq!(record.original, 0x90);
    assert_eq!(fixture.host.peek(address, 1), Some(vec![0x90]));
    assert_eq!(fixture.client.breakpoints().count(), 0);
}

#[test]
fn test_breakpoint_on_unmapped_address()
{
    let mut fixture = Fixture::new();
    let address = Address::from(0x9000);
    assert!(fixture.client.add_breakpoint(address).is_err());
    assert!(fixture.client.breakpoint(address).is_none());
}

#[test]
fn test_stop_notification_reaches_handler()
{
    let mut fixture = Fixture::new();
    let seen = Arc::new(Mutex::new(Vec::<DebugEvent>::new()));
    {
        let seen = Arc::clone(&seen);
        fixture
            .client
            .set_stop_handler(move |event| seen.lock().unwrap().push(event.clone()));
    }

    fixture.client.request_continue_background().unwrap();
    assert!(fixture.client.is_running());

    fixture.stub.handle().exception(ThreadId(7), signal::SIGSEGV, None);
    let event = fixture.client.wait_for_stop(WAIT).unwrap();

    assert_eq!(event.signal, 11);
    assert_eq!(event.state, ProcessState::Stopped);
    assert!(!fixture.client.is_running());
    assert_eq!(seen.lock().unwrap().as_slice(), &[DebugEvent::stopped(11)]);
    assert_eq!(fixture.client.last_event(), Some(&DebugEvent::stopped(11)));
}

#[test]
fn test_notification_before_reply()
{
    let mut fixture = Fixture::new();
    let events = fixture.client.subscribe();

    fixture.stub.handle().exception(ThreadId(7), signal::SIGTRAP, None);
    wait_until(|| fixture.stub.is_broken());
    thread::sleep(Duration::from_millis(50));

    let bytes = fixture.client.read_memory(Address::from(0x1000), 2).unwrap();
    assert_eq!(bytes, vec![0xde, 0xad]);
    assert_eq!(events.try_recv().unwrap(), DebugEvent::stopped(5));
}

#[test]
fn test_blocking_continue()
{
    let mut fixture = Fixture::new();
    let handle = fixture.stub.handle();
    let trigger = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        handle.exception(ThreadId(7), signal::SIGTRAP, Some(Address::from(0x2000)));
    });

    let event = fixture.client.request_continue().unwrap();
    trigger.join().unwrap();
    assert_eq!(event.signal, signal::SIGTRAP);
    assert!(!fixture.client.is_running());
    assert_eq!(fixture.client.last_signal().unwrap(), signal::SIGTRAP);
}

#[test]
fn test_blocking_step()
{
    let mut fixture = Fixture::new();
    fixture.client.request_break().unwrap();
    fixture.client.wait_for_stop(WAIT).unwrap();

    let handle = fixture.stub.handle();
    let host = Arc::clone(&fixture.host);
    let trigger = thread::spawn(move || {
        wait_until(|| host.single_step_armed(ThreadId(7)));
        handle.exception(ThreadId(7), signal::SIGTRAP, None);
    });

    let event = fixture.client.request_step().unwrap();
    trigger.join().unwrap();
    assert_eq!(event, DebugEvent::stopped(signal::SIGTRAP));
}

#[test]
fn test_break_request()
{
    let mut fixture = Fixture::new();
    fixture.client.request_break().unwrap();
    let event = fixture.client.wait_for_stop(WAIT).unwrap();

    assert_eq!(event.signal, signal::INTERRUPTED);
    assert_eq!(event.describe(), "Stopped by break request");
    assert!(fixture.stub.is_broken());
    assert_eq!(fixture.client.last_signal().unwrap(), signal::INTERRUPTED);
}

#[test]
fn test_registers_round_trip()
{
    let mut fixture = Fixture::new();
    fixture.client.request_break().unwrap();
    fixture.client.wait_for_stop(WAIT).unwrap();

    let registers = fixture.client.registers().unwrap();
    assert_eq!(registers, vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);

    let updated = vec![0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7];
    fixture.client.set_registers(&updated).unwrap();
    assert_eq!(fixture.client.registers().unwrap(), updated);
    assert!(matches!(fixture.client.set_registers(&[0; 3]), Err(DebugError::Remote(0x01))));

    fixture.client.request_continue_background().unwrap();
    wait_until(|| !fixture.stub.is_broken());
    assert_eq!(fixture.host.registers(ThreadId(7)), Some(updated));
}

#[test]
fn test_thread_queries()
{
    let mut fixture = Fixture::new();
    fixture.host.spawn_thread(ThreadId(0x1a), vec![0; 8]);
    fixture.stub.handle().thread_created(ThreadId(0x1a));

    assert_eq!(fixture.client.threads().unwrap(), vec![ThreadId(7), ThreadId(0x1a)]);
    assert_eq!(fixture.client.current_thread().unwrap(), Some(ThreadId(7)));
    assert!(fixture.client.thread_alive(ThreadId(0x1a)).unwrap());
    assert!(!fixture.client.thread_alive(ThreadId(0x99)).unwrap());
}

#[test]
fn test_target_queries()
{
    let config = StubConfig {
        exec_path: "/sandbox/hello.nexe".to_string(),
        architecture: "i386".to_string(),
        ..StubConfig::new(PID)
    };
    let mut fixture = Fixture::with_options(config, ClientOptions::default());

    assert_eq!(fixture.client.exec_path().unwrap(), "/sandbox/hello.nexe");
    assert_eq!(fixture.client.architecture().unwrap(), "i386");
    assert!(fixture.client.target_description().unwrap().starts_with("<target>"));
}

#[test]
fn test_sequence_numbers()
{
    let options = ClientOptions {
        flags: TransportFlags {
            use_sequence: true,
            ..TransportFlags::default()
        },
        ..ClientOptions::default()
    };
    let mut fixture = Fixture::with_options(StubConfig::new(PID), options);

    for _ in 0..3 {
        let bytes = fixture.client.read_memory(Address::from(0x1000), 4).unwrap();
        assert_eq!(bytes, vec![0xde, 0xad, 0xbe, 0xef]);
    }
    fixture.client.request_break().unwrap();
    assert_eq!(fixture.client.wait_for_stop(WAIT).unwrap().signal, signal::INTERRUPTED);
    assert_eq!(fixture.client.last_signal().unwrap(), signal::INTERRUPTED);
}

#[test]
fn test_kill()
{
    let mut fixture = Fixture::new();
    fixture.client.request_break().unwrap();
    fixture.client.wait_for_stop(WAIT).unwrap();

    fixture.client.kill().unwrap();
    assert!(!fixture.client.is_running());
    wait_until(|| fixture.host.killed_threads() == vec![ThreadId(7)]);
    assert_eq!(fixture.client.threads().unwrap(), Vec::<ThreadId>::new());
}

#[test]
fn test_lost_connection_is_fatal()
{
    let mut fixture = Fixture::new();
    fixture.stop_server();

    let error = fixture.client.read_memory(Address::from(0x1000), 4).unwrap_err();
    assert!(error.is_connection_lost());
}

#[test]
fn test_output_and_stale_replies()
{
    let (debugger_end, target_end) = memory_pair();
    let fake_stub = thread::spawn(move || {
        let mut transport = Transport::new(Box::new(target_end));
        let mut request = Packet::new();
        transport.receive(&mut request, WAIT).unwrap();
        assert_eq!(request.payload(), b"M3000,1:ff");
        let sequence = request.sequence().unwrap();

        transport.send(&Packet::from_payload("O6869"), WAIT).unwrap();
        let mut stale = Packet::from_payload("E03");
        stale.set_sequence(sequence.wrapping_add(1));
        transport.send(&stale, WAIT).unwrap();
        let mut reply = Packet::from_payload("OK");
        reply.set_sequence(sequence);
        transport.send(&reply, WAIT).unwrap();
    });

    let options = ClientOptions {
        timeout: WAIT,
        flags: TransportFlags {
            use_sequence: true,
            ..TransportFlags::default()
        },
    };
    let mut client = DebugClient::new(debugger_end, options);
    let (sender, output) = mpsc::channel();
    client.set_output_handler(move |bytes| sender.send(bytes.to_vec()).unwrap());

    client.write_memory(Address::from(0x3000), &[0xff]).unwrap();
    fake_stub.join().unwrap();
    assert_eq!(output.try_recv().unwrap(), b"hi".to_vec());
}

#[test]
fn test_stop_crossing_status_request()
{
    let (debugger_end, target_end) = memory_pair();
    let fake_stub = thread::spawn(move || {
        let mut transport = Transport::new(Box::new(target_end));
        let mut request = Packet::new();
        transport.receive(&mut request, WAIT).unwrap();
        assert_eq!(request.payload(), b"c");
        transport.receive(&mut request, WAIT).unwrap();
        assert_eq!(request.payload(), b"?");
        transport.send(&Packet::from_payload("T05thread:7;"), WAIT).unwrap();
    });

    let options = ClientOptions {
        timeout: WAIT,
        ..ClientOptions::default()
    };
    let mut client = DebugClient::new(debugger_end, options);
    let seen = Arc::new(Mutex::new(Vec::<DebugEvent>::new()));
    {
        let seen = Arc::clone(&seen);
        client.set_stop_handler(move |event| seen.lock().unwrap().push(event.clone()));
    }

    client.request_continue_background().unwrap();
    assert_eq!(client.last_signal().unwrap(), signal::SIGTRAP);
    fake_stub.join().unwrap();

    assert!(!client.is_running());
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].context, Some(ThreadId(7)));
    assert_eq!(client.last_event(), Some(&seen[0]));
}

#[test]
fn test_exec_path_resembling_notification()
{
    for exec_path in ["W1d/sandbox/app", "O6869"] {
        let config = StubConfig {
            exec_path: exec_path.to_string(),
            ..StubConfig::new(PID)
        };
        let mut fixture = Fixture::with_options(config, ClientOptions::default());

        assert_eq!(fixture.client.exec_path().unwrap(), exec_path);
        assert_eq!(fixture.client.last_event(), None);
    }
}

#[test]
fn test_tcp_session()
{
    let host = simulated_target();
    let config = StubConfig {
        poll_interval: Duration::from_millis(5),
        ..StubConfig::new(PID)
    };
    let stub = Arc::new(Stub::new(host, config).unwrap());
    let listener = TcpServer::bind(SocketAddress::new([127, 0, 0, 1], 0)).unwrap();
    let address = listener.local_address().unwrap();
    let shutdown = Arc::new(AtomicBool::new(false));

    let server = {
        let stub = Arc::clone(&stub);
        let shutdown = Arc::clone(&shutdown);
        thread::spawn(move || stub.serve(&listener, &shutdown).unwrap())
    };

    let mut client = DebugClient::connect(address, ClientOptions::default()).unwrap();
    let bytes = client.read_memory(Address::from(0x1000), 4).unwrap();
    assert_eq!(bytes, vec![0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(stub.connection_state(), ConnectionState::Serving);

    drop(client);
    wait_until(|| stub.connection_state() == ConnectionState::AcceptPending);

    shutdown.store(true, Ordering::Relaxed);
    server.join().unwrap();
    assert_eq!(stub.connection_state(), ConnectionState::Idle);
}
