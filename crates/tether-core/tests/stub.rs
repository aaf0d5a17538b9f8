//! Tests for the stub's command handling, driven over the wire
//!
//! Both ends run on the test thread with acknowledgements off, so a request
//! can be written, pumped and answered without a second thread.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tether_core::host::Protection;
use tether_core::platform::SimulatedHost;
use tether_core::stub::{ConnectionState, PumpStatus, Stub, StubConfig};
use tether_core::types::{signal, Address, ProcessId, ThreadId};
use tether_protocol::stream::memory_pair;
use tether_protocol::{Packet, Transport, TransportError, TransportFlags};

const PID: ProcessId = ProcessId(42);
const TIMEOUT: Duration = Duration::from_secs(1);

struct Harness
{
    host: Arc<SimulatedHost>,
    stub: Stub,
    target: Transport,
    debugger: Transport,
}

impl Harness
{
    fn new() -> Self
    {
        Self::with_config(StubConfig::new(PID))
    }

    fn with_config(config: StubConfig) -> Self
    {
        let host = Arc::new(SimulatedHost::new(PID));
        host.map_region(Address::from(0x1000), vec![0xde, 0xad, 0xbe, 0xef], Protection::READ);
        host.map_region(Address::from(0x2000), vec![0x90; 16], Protection::READ_EXECUTE);
        host.spawn_thread(ThreadId(7), vec![0x11, 0x22, 0x33, 0x44]);
        host.spawn_thread(ThreadId(9), vec![0x55, 0x66, 0x77, 0x88]);
        Self::from_host(host, config)
    }

    fn from_host(host: Arc<SimulatedHost>, config: StubConfig) -> Self
    {
        let stub = Stub::new(host.clone(), config).unwrap();
        let flags = TransportFlags {
            ignore_ack: true,
            ..TransportFlags::default()
        };
        let (debugger_end, target_end) = memory_pair();
        Self {
            host,
            stub,
            target: Transport::with_flags(Box::new(target_end), flags),
            debugger: Transport::with_flags(Box::new(debugger_end), flags),
        }
    }

    /// Send `payload`, pump once, and return the reply, if any.
    fn request(&mut self, payload: &str) -> Option<String>
    {
        self.debugger.send(&Packet::from_payload(payload), TIMEOUT).unwrap();
        assert_eq!(self.stub.pump(&mut self.target).unwrap(), PumpStatus::Processed);
        self.reply()
    }

    fn reply(&mut self) -> Option<String>
    {
        let mut packet = Packet::new();
        match self.debugger.receive(&mut packet, Duration::from_millis(50)) {
            Ok(()) => Some(String::from_utf8(packet.payload().to_vec()).unwrap()),
            Err(TransportError::Timeout(_)) => None,
            Err(err) => panic!("unexpected transport error: {err}"),
        }
    }

    fn interrupt(&mut self) -> Option<String>
    {
        self.debugger.send_interrupt().unwrap();
        assert_eq!(self.stub.pump(&mut self.target).unwrap(), PumpStatus::Processed);
        self.reply()
    }
}

fn reply(text: &str) -> Option<String>
{
    Some(text.to_string())
}

#[test]
fn test_idle_pump()
{
    let mut harness = Harness::new();
    assert_eq!(harness.stub.pump(&mut harness.target).unwrap(), PumpStatus::Idle);
    assert_eq!(harness.reply(), None);
}

#[test]
fn test_status_while_running()
{
    let mut harness = Harness::new();
    assert_eq!(harness.request("?"), reply("S00"));
}

#[test]
fn test_read_memory()
{
    let mut harness = Harness::new();
    assert_eq!(harness.request("m1000,4"), reply("deadbeef"));
    assert_eq!(harness.request("m1001,2"), reply("adbe"));
    assert_eq!(harness.request("m1000,0"), reply(""));
    assert_eq!(harness.host.protection_at(Address::from(0x1000)), Some(Protection::READ));
}

#[test]
fn test_read_memory_errors()
{
    let mut harness = Harness::new();
    assert_eq!(harness.request("m1000"), reply("E01"));
    assert_eq!(harness.request("m1000;4"), reply("E01"));
    assert_eq!(harness.request("mffffffffffffffff,10"), reply("E01"));
    assert_eq!(harness.request("m9000,4"), reply("E03"));
    assert_eq!(harness.request("m1002,4"), reply("E03"));
}

#[test]
fn test_write_memory_restores_protection_and_flushes()
{
    let mut harness = Harness::new();
    assert_eq!(harness.request("M2000,2:0102"), reply("OK"));
    assert_eq!(harness.host.peek(Address::from(0x2000), 3), Some(vec![0x01, 0x02, 0x90]));
    assert_eq!(harness.host.protection_at(Address::from(0x2000)), Some(Protection::READ_EXECUTE));
    assert_eq!(harness.host.flush_count(), 1);
}

#[test]
fn test_write_memory_errors()
{
    let mut harness = Harness::new();
    assert_eq!(harness.request("M2000,2:01"), reply("E01"));
    assert_eq!(harness.request("M2000,1:0102"), reply("E01"));
    assert_eq!(harness.request("M2000,1"), reply("E01"));
    assert_eq!(harness.request("M9000,1:00"), reply("E03"));
    assert_eq!(harness.host.peek(Address::from(0x2000), 1), Some(vec![0x90]));
}

#[test]
fn test_registers_without_threads()
{
    let host = Arc::new(SimulatedHost::new(PID));
    let mut harness = Harness::from_host(host, StubConfig::new(PID));
    assert_eq!(harness.request("g"), reply("E02"));
    assert_eq!(harness.request("G00"), reply("E02"));
    assert_eq!(harness.request("qfThreadInfo"), reply("l"));
}

#[test]
fn test_registers_of_first_thread()
{
    let mut harness = Harness::new();
    assert_eq!(harness.request("g"), reply("11223344"));
}

#[test]
fn test_register_write_is_applied_on_resume()
{
    let mut harness = Harness::new();
    assert_eq!(harness.interrupt(), reply("Sff"));
    assert_eq!(harness.request("G0a0b0c"), reply("E01"));
    assert_eq!(harness.request("Gaabbccdd"), reply("OK"));
    assert_eq!(harness.request("g"), reply("aabbccdd"));
    assert_eq!(harness.host.registers(ThreadId(7)), Some(vec![0x11, 0x22, 0x33, 0x44]));

    assert_eq!(harness.request("c"), None);
    assert_eq!(harness.host.registers(ThreadId(7)), Some(vec![0xaa, 0xbb, 0xcc, 0xdd]));
}

#[test]
fn test_thread_select_is_rejected()
{
    let mut harness = Harness::new();
    assert_eq!(harness.request("Hg7"), reply("E01"));
    assert_eq!(harness.request("Hc-1"), reply("E01"));
}

#[test]
fn test_thread_alive()
{
    let mut harness = Harness::new();
    assert_eq!(harness.request("T7"), reply("OK"));
    assert_eq!(harness.request("T8"), reply("E02"));
    assert_eq!(harness.request("T"), reply("E01"));
}

#[test]
fn test_unknown_command()
{
    let mut harness = Harness::new();
    assert_eq!(harness.request("vCont?"), reply("E01"));
    assert_eq!(harness.request(""), reply("E01"));
}

#[test]
fn test_queries()
{
    let config = StubConfig {
        exec_path: "/sandbox/app.nexe".to_string(),
        ..StubConfig::new(PID)
    };
    let mut harness = Harness::with_config(config);

    assert_eq!(harness.request("qAttached"), reply("1"));
    assert_eq!(harness.request("qC"), reply("QC07"));
    assert_eq!(harness.request("qExecPath"), reply("/sandbox/app.nexe"));
    assert_eq!(harness.request("qfThreadInfo"), reply("m07,09"));
    assert_eq!(harness.request("qsThreadInfo"), reply("l"));
    assert_eq!(
        harness.request("qSupported:multiprocess+"),
        reply("PacketSize=3fff;qXfer:features:read+;multiprocess+;qXfer:threads:read+")
    );
    assert_eq!(
        harness.request("qXfer:features:read:target.xml:0,fff"),
        reply("l<target><architecture>i386:x86-64</architecture><osabi>GNU/Linux</osabi></target>")
    );
    assert_eq!(
        harness.request("qXfer:threads:read::0,fff"),
        reply("l<threads>\n<thread id=\"7\" core=\"0\"/>\n<thread id=\"9\" core=\"0\"/>\n</threads>\n")
    );
    assert_eq!(harness.request("qRcmd,6865"), reply(""));
}

#[test]
fn test_signal_is_reported_once_and_holds_all_threads()
{
    let mut harness = Harness::new();
    harness.stub.handle().exception(ThreadId(7), signal::SIGSEGV, None);

    assert_eq!(harness.stub.pump(&mut harness.target).unwrap(), PumpStatus::Notified);
    assert_eq!(harness.reply(), reply("S0b"));
    assert!(harness.stub.is_broken());
    assert_eq!(harness.stub.current_thread(), Some(ThreadId(7)));
    assert!(harness.host.is_suspended(ThreadId(9)));

    assert_eq!(harness.stub.pump(&mut harness.target).unwrap(), PumpStatus::Idle);
    assert_eq!(harness.reply(), None);
    assert_eq!(harness.request("?"), reply("S0b"));
    assert_eq!(harness.request("qC"), reply("QC07"));
}

#[test]
fn test_continue_releases_threads()
{
    let mut harness = Harness::new();
    harness.stub.handle().exception(ThreadId(9), signal::SIGTRAP, None);
    harness.stub.pump(&mut harness.target).unwrap();
    assert_eq!(harness.reply(), reply("S05"));

    assert_eq!(harness.request("c"), None);
    assert!(!harness.stub.is_broken());
    assert!(!harness.host.is_suspended(ThreadId(7)));
    assert_eq!(harness.host.resume_count(ThreadId(7)), 1);
    assert_eq!(harness.host.resume_count(ThreadId(9)), 1);
    assert!(!harness.host.single_step_armed(ThreadId(9)));
    assert_eq!(harness.request("?"), reply("S00"));
}

#[test]
fn test_step_arms_only_current_thread()
{
    let mut harness = Harness::new();
    harness.stub.handle().exception(ThreadId(9), signal::SIGTRAP, None);
    harness.stub.pump(&mut harness.target).unwrap();
    harness.reply();

    assert_eq!(harness.request("s"), None);
    assert!(harness.host.single_step_armed(ThreadId(9)));
    assert!(!harness.host.single_step_armed(ThreadId(7)));

    harness.stub.handle().exception(ThreadId(9), signal::SIGTRAP, None);
    harness.stub.pump(&mut harness.target).unwrap();
    assert_eq!(harness.reply(), reply("S05"));
    assert_eq!(harness.request("c"), None);
    assert!(!harness.host.single_step_armed(ThreadId(9)));
}

#[test]
fn test_break_request()
{
    let mut harness = Harness::new();
    assert_eq!(harness.interrupt(), reply("Sff"));
    assert!(harness.stub.is_broken());
    assert!(harness.host.is_suspended(ThreadId(7)));
    assert!(harness.host.is_suspended(ThreadId(9)));

    // A second break while held reports the same stop.
    assert_eq!(harness.interrupt(), reply("Sff"));
    assert_eq!(harness.request("c"), None);
    assert!(!harness.host.is_suspended(ThreadId(7)));
    assert!(!harness.host.is_suspended(ThreadId(9)));
}

#[test]
fn test_unreported_signal_survives_resume()
{
    let mut harness = Harness::new();
    harness.stub.handle().exception(ThreadId(7), signal::SIGTRAP, None);
    harness.stub.handle().exception(ThreadId(9), signal::SIGSEGV, None);
    harness.stub.pump(&mut harness.target).unwrap();
    assert_eq!(harness.reply(), reply("S05"));

    assert_eq!(harness.request("c"), None);
    assert_eq!(harness.stub.pump(&mut harness.target).unwrap(), PumpStatus::Notified);
    assert_eq!(harness.reply(), reply("S0b"));
    assert_eq!(harness.stub.current_thread(), Some(ThreadId(9)));
}

#[test]
fn test_thread_created_while_broken_is_suspended()
{
    let mut harness = Harness::new();
    harness.interrupt();

    harness.host.spawn_thread(ThreadId(0x10), vec![0; 4]);
    harness.stub.handle().thread_created(ThreadId(0x10));
    assert_eq!(harness.request("qfThreadInfo"), reply("m07,09,10"));
    assert!(harness.host.is_suspended(ThreadId(0x10)));
}

#[test]
fn test_thread_exit()
{
    let mut harness = Harness::new();
    harness.host.exit_thread(ThreadId(7));
    harness.stub.handle().thread_exited(ThreadId(7));
    assert_eq!(harness.request("T7"), reply("E02"));
    assert_eq!(harness.stub.threads(), vec![ThreadId(9)]);
}

#[test]
fn test_software_breakpoint_packets()
{
    let mut harness = Harness::new();
    let address = Address::from(0x2004);

    assert_eq!(harness.request("Z0,2004,1"), reply("OK"));
    assert_eq!(harness.host.peek(address, 1), Some(vec![0xcc]));
    assert_eq!(harness.stub.breakpoints().len(), 1);

    assert_eq!(harness.request("z0,2004,1"), reply("OK"));
    assert_eq!(harness.host.peek(address, 1), Some(vec![0x90]));
    assert!(harness.stub.breakpoints().is_empty());

    assert_eq!(harness.request("z0,2004,1"), reply("E01"));
    assert_eq!(harness.request("Z1,2004,1"), reply(""));
    assert_eq!(harness.request("Z0,9000,1"), reply("E03"));
    assert_eq!(harness.request("Z0"), reply("E01"));
}

#[test]
fn test_kill_releases_every_thread()
{
    let mut harness = Harness::new();
    harness.interrupt();
    assert_eq!(harness.request("k"), None);

    assert_eq!(harness.host.killed_threads(), vec![ThreadId(7), ThreadId(9)]);
    assert!(harness.stub.threads().is_empty());
    assert_eq!(harness.request("qfThreadInfo"), reply("l"));
}

#[test]
fn test_kill_while_running()
{
    let mut harness = Harness::new();
    assert!(!harness.stub.is_broken());
    assert_eq!(harness.request("k"), None);

    assert_eq!(harness.host.killed_threads(), vec![ThreadId(7), ThreadId(9)]);
    assert!(harness.stub.threads().is_empty());
    assert!(!harness.stub.is_broken());
}

#[test]
fn test_step_while_running_is_not_remembered()
{
    let mut harness = Harness::new();
    harness.interrupt();
    assert_eq!(harness.request("c"), None);

    // Thread 7 is still current but already running; the step request
    // releases nothing and must not linger until the next resume.
    assert_eq!(harness.request("s"), None);
    assert!(!harness.host.single_step_armed(ThreadId(7)));

    harness.interrupt();
    assert_eq!(harness.request("c"), None);
    assert!(!harness.host.single_step_armed(ThreadId(7)));
    assert_eq!(harness.host.resume_count(ThreadId(7)), 2);
}

#[test]
fn test_step_without_current_thread()
{
    let mut harness = Harness::new();
    assert_eq!(harness.request("s"), reply("E01"));
    assert!(!harness.host.single_step_armed(ThreadId(7)));
    assert!(!harness.host.single_step_armed(ThreadId(9)));
    assert_eq!(harness.host.resume_count(ThreadId(7)), 0);
}

#[test]
fn test_break_at_start()
{
    let config = StubConfig {
        break_at: Some(Address::from(0x2008)),
        ..StubConfig::new(PID)
    };
    let mut harness = Harness::with_config(config);
    assert_eq!(harness.host.peek(Address::from(0x2008), 1), Some(vec![0xcc]));

    harness
        .stub
        .handle()
        .exception(ThreadId(7), signal::SIGTRAP, Some(Address::from(0x2008)));
    harness.stub.pump(&mut harness.target).unwrap();
    assert_eq!(harness.reply(), reply("S05"));
    assert_eq!(harness.host.peek(Address::from(0x2008), 1), Some(vec![0x90]));
    assert!(harness.stub.breakpoints().is_empty());
}

#[test]
fn test_target_side_breakpoints()
{
    let harness = Harness::new();
    let address = Address::from(0x2001);
    assert!(harness.stub.add_breakpoint(address).unwrap());
    assert!(!harness.stub.add_breakpoint(address).unwrap());
    assert_eq!(harness.host.peek(address, 1), Some(vec![0xcc]));

    harness.stub.remove_breakpoint(address).unwrap();
    assert_eq!(harness.host.peek(address, 1), Some(vec![0x90]));
    assert!(harness.stub.remove_breakpoint(address).is_err());
}

#[test]
fn test_reply_echoes_request_sequence()
{
    let mut harness = Harness::new();
    let mut request = Packet::from_payload("m1000,1");
    request.set_sequence(0x2a);
    harness.debugger.send(&request, TIMEOUT).unwrap();
    harness.stub.pump(&mut harness.target).unwrap();

    let mut reply = Packet::new();
    harness.debugger.receive(&mut reply, TIMEOUT).unwrap();
    assert_eq!(reply.sequence(), Some(0x2a));
    assert_eq!(reply.payload(), b"de");
}

#[test]
fn test_serve_connection_ends_when_debugger_leaves()
{
    let Harness {
        stub,
        mut target,
        debugger,
        ..
    } = Harness::new();
    assert_eq!(stub.connection_state(), ConnectionState::Idle);

    drop(debugger);
    stub.serve_connection(&mut target, &AtomicBool::new(false)).unwrap();
    assert_eq!(stub.connection_state(), ConnectionState::Idle);
}

#[test]
fn test_state_survives_reconnect()
{
    let Harness {
        host, stub, debugger, ..
    } = Harness::new();
    drop(debugger);
    stub.add_breakpoint(Address::from(0x2002)).unwrap();

    let flags = TransportFlags {
        ignore_ack: true,
        ..TransportFlags::default()
    };
    let (debugger_end, target_end) = memory_pair();
    let mut harness = Harness {
        host,
        stub,
        target: Transport::with_flags(Box::new(target_end), flags),
        debugger: Transport::with_flags(Box::new(debugger_end), flags),
    };
    assert_eq!(harness.request("qfThreadInfo"), reply("m07,09"));
    assert_eq!(harness.request("m2002,1"), reply("cc"));
    assert_eq!(harness.stub.breakpoints().len(), 1);
}
