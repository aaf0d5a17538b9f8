use std::error::Error;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tether_core::host::Protection;
use tether_core::platform::SimulatedHost;
use tether_core::types::{signal, Address, ProcessId, ThreadId};
use tether_core::{ClientOptions, DebugClient, Stub, StubConfig};
use tether_protocol::stream::TcpServer;
use tether_protocol::SocketAddress;
use tether_utils::{info, init_logging, TetherConfig};

type CliResult<T = ()> = Result<T, Box<dyn Error>>;

const DEMO_PID: ProcessId = ProcessId(1);
const DEMO_THREAD: ThreadId = ThreadId(1);
const DEMO_CODE: u64 = 0x1000;
const DEMO_DATA: u64 = 0x2000;
const DEMO_REGISTER_BYTES: usize = 0x80;

/// Remote debugging over a framed, checksummed packet protocol.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version)]
#[command(about = "Remote debugging over a framed, checksummed packet protocol", long_about = None)]
struct Cli
{
    /// Stub address as A.B.C.D:port (overrides TETHER_ADDRESS)
    #[arg(long = "address", id = "stub_address", global = true)]
    address: Option<String>,
    /// Request timeout in milliseconds (overrides TETHER_TIMEOUT_MS)
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,
    /// Number requests with sequence prefixes (overrides TETHER_SEQUENCE)
    #[arg(long, global = true, default_value_t = false)]
    sequence: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Serve a simulated target to debuggers until interrupted
    Serve
    {
        /// Executable path reported to debuggers
        #[arg(long, default_value = "/sandbox/demo")]
        exec_path: String,
        /// Stop the target the first time it reaches this address (hex 0x1000 or decimal)
        #[arg(long, value_parser = parse_address)]
        break_at: Option<Address>,
        /// Make the simulated thread raise SIGTRAP this often while running
        #[arg(long)]
        trap_every_ms: Option<u64>,
    },
    /// Show target information (executable, architecture, threads, last signal)
    Info,
    /// Read target memory
    Memory
    {
        /// Memory address to read from (hex format: 0x1000 or decimal)
        #[arg(value_parser = parse_address)]
        address: Address,
        /// Number of bytes to read (default: 16)
        #[arg(short, long, default_value_t = 16)]
        length: usize,
    },
    /// Write bytes to target memory
    Write
    {
        /// Memory address to write to (hex format: 0x1000 or decimal)
        #[arg(value_parser = parse_address)]
        address: Address,
        /// Bytes as a hex string, e.g. 90c3
        bytes: String,
    },
    /// Dump the current thread's register blob
    Registers,
    /// List the target's threads
    Threads,
    /// Resume the target and wait for it to stop
    Continue
    {
        /// Return as soon as the target is resumed
        #[arg(long, default_value_t = false)]
        background: bool,
    },
    /// Single-step the current thread
    Step
    {
        /// Return as soon as the step is requested
        #[arg(long, default_value_t = false)]
        background: bool,
    },
    /// Stop a running target
    Interrupt,
    /// Plant a software breakpoint
    Breakpoint
    {
        /// Instruction address (hex format: 0x1000 or decimal)
        #[arg(value_parser = parse_address)]
        address: Address,
    },
}

fn main()
{
    // Initialize logging (reads RUST_LOG, TETHER_LOG_FORMAT, TETHER_LOG_FILE)
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {e}");
        process::exit(1);
    }

    let cli = Cli::parse();

    if let Err(e) = run_command(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(cli: Cli) -> CliResult
{
    let config = apply_overrides(&cli, TetherConfig::from_env()?)?;

    match cli.command {
        Commands::Serve {
            exec_path,
            break_at,
            trap_every_ms,
        } => serve(&config, exec_path, break_at, trap_every_ms.map(Duration::from_millis)),
        Commands::Info => {
            let mut client = connect(&config)?;
            println!("\nTarget Information:");
            println!("  Executable: {}", client.exec_path()?);
            println!("  Architecture: {}", client.architecture()?);
            println!("  Threads: {}", client.threads()?.len());
            if let Some(thread) = client.current_thread()? {
                println!("  Current Thread: {thread}");
            }
            println!("  Last Signal: {}", client.last_signal()?);
            Ok(())
        }
        Commands::Memory { address, length } => {
            let mut client = connect(&config)?;
            let bytes = client.read_memory(address, length)?;
            print_hex_dump(address, &bytes);
            Ok(())
        }
        Commands::Write { address, bytes } => {
            let bytes = parse_hex_bytes(&bytes)?;
            let mut client = connect(&config)?;
            client.write_memory(address, &bytes)?;
            println!("Wrote {} bytes at {address}", bytes.len());
            Ok(())
        }
        Commands::Registers => {
            let mut client = connect(&config)?;
            let blob = client.registers()?;
            print_hex_dump(Address::ZERO, &blob);
            Ok(())
        }
        Commands::Threads => {
            let mut client = connect(&config)?;
            let current = client.current_thread()?;
            for thread in client.threads()? {
                let marker = if Some(thread) == current { "*" } else { " " };
                println!("{marker} {thread}");
            }
            Ok(())
        }
        Commands::Continue { background } => {
            let mut client = connect(&config)?;
            if background {
                client.request_continue_background()?;
                println!("Target resumed");
            } else {
                println!("{}", client.request_continue()?.describe());
            }
            Ok(())
        }
        Commands::Step { background } => {
            let mut client = connect(&config)?;
            if background {
                client.request_step_background()?;
                println!("Step requested");
            } else {
                println!("{}", client.request_step()?.describe());
            }
            Ok(())
        }
        Commands::Interrupt => {
            let mut client = connect(&config)?;
            client.request_break()?;
            println!("{}", client.wait_for_stop(config.timeout)?.describe());
            Ok(())
        }
        Commands::Breakpoint { address } => {
            let mut client = connect(&config)?;
            if !client.add_breakpoint(address)? {
                println!("Breakpoint at {address} already set");
            }
            if let Some(record) = client.breakpoint(address) {
                println!("Breakpoint at {address} (original byte {:02x})", record.original);
            }
            Ok(())
        }
    }
}

/// Environment settings with command-line overrides applied.
/// Layer the global command-line options over `config`.
fn apply_overrides(cli: &Cli, mut config: TetherConfig) -> CliResult<TetherConfig>
{
    if let Some(address) = &cli.address {
        let parsed = SocketAddress::parse(address);
        if parsed.port() == 0 {
            return Err(format!("invalid address {address:?}, expected A.B.C.D:port").into());
        }
        config.address = parsed;
    }
    if let Some(millis) = cli.timeout_ms {
        config.timeout = Duration::from_millis(millis.max(1));
    }
    if cli.sequence {
        config.sequence = true;
    }
    Ok(config)
}

fn connect(config: &TetherConfig) -> CliResult<DebugClient>
{
    let options = ClientOptions {
        timeout: config.timeout,
        flags: config.client_flags(),
    };
    info!(address = %config.address, "Connecting to stub");
    let mut client = DebugClient::connect(config.address, options)?;
    client.set_output_handler(|bytes| print!("{}", String::from_utf8_lossy(bytes)));
    Ok(client)
}

fn serve(config: &TetherConfig, exec_path: String, break_at: Option<Address>, trap_every: Option<Duration>) -> CliResult
{
    let host = Arc::new(demo_target());
    let stub_config = StubConfig {
        exec_path,
        break_at,
        timeout: config.timeout,
        poll_interval: config.poll_interval,
        transport_flags: config.stub_flags(),
        ..StubConfig::new(host.pid())
    };
    let stub = Stub::new(host, stub_config)?;

    let listener = TcpServer::bind(config.address)?;
    println!("Stub listening on {}", listener.local_address()?);

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))?;

    let stub = &stub;
    let shutdown: &AtomicBool = &shutdown;
    thread::scope(|scope| {
        if let Some(interval) = trap_every {
            scope.spawn(move || raise_traps(stub, shutdown, interval, break_at));
        }
        stub.serve(&listener, shutdown)
    })?;

    info!("Stub stopped");
    Ok(())
}

/// One process with a code page, a data page and a single thread.
fn demo_target() -> SimulatedHost
{
    let host = SimulatedHost::new(DEMO_PID);

    let mut code = vec![0x90; 0x100];
    code[0xff] = 0xc3;
    host.map_region(Address::new(DEMO_CODE), code, Protection::READ_EXECUTE);

    let mut data = b"hello from the sandbox\n".to_vec();
    data.resize(0x100, 0);
    host.map_region(Address::new(DEMO_DATA), data, Protection::READ_WRITE);

    host.spawn_thread(DEMO_THREAD, vec![0; DEMO_REGISTER_BYTES]);
    host
}

/// Stand-in for a program executing `int3`: while the target runs, report a
/// SIGTRAP on its first thread every `interval`.
fn raise_traps(stub: &Stub, shutdown: &AtomicBool, interval: Duration, address: Option<Address>)
{
    let handle = stub.handle();
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(interval);
        if stub.is_broken() {
            continue;
        }
        if let Some(thread) = stub.threads().first().copied() {
            handle.exception(thread, signal::SIGTRAP, address);
        }
    }
}

fn print_hex_dump(base: Address, bytes: &[u8])
{
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let offset = (row * 16) as u64;
        let hex: Vec<String> = chunk.iter().map(|byte| format!("{byte:02x}")).collect();
        let text: String = chunk
            .iter()
            .map(|&byte| if byte.is_ascii_graphic() || byte == b' ' { char::from(byte) } else { '.' })
            .collect();
        println!("{:#010x}  {:<47}  {text}", base.value().wrapping_add(offset), hex.join(" "));
    }
}

/// Parse `0x`-prefixed hex or decimal.
fn parse_address(text: &str) -> Result<Address, String>
{
    let text = text.trim();
    let value = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    value
        .map(Address::new)
        .map_err(|err| format!("invalid address {text:?}: {err}"))
}

/// Parse a string of hex digit pairs.
fn parse_hex_bytes(text: &str) -> Result<Vec<u8>, String>
{
    let digits = text.trim();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(format!("expected an even number of hex digits, got {digits:?}"));
    }
    (0..digits.len())
        .step_by(2)
        .map(|index| {
            digits
                .get(index..index + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("invalid hex byte at offset {index} in {digits:?}"))
        })
        .collect()
}

#[cfg(test)]
mod tests
{
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition()
    {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_address()
    {
        assert_eq!(parse_address("0x1000").unwrap(), Address::new(0x1000));
        assert_eq!(parse_address("0XfF").unwrap(), Address::new(0xff));
        assert_eq!(parse_address("4096").unwrap(), Address::new(4096));
        assert!(parse_address("0x").is_err());
        assert!(parse_address("ten").is_err());
    }

    #[test]
    fn test_parse_hex_bytes()
    {
        assert_eq!(parse_hex_bytes("90c3").unwrap(), vec![0x90, 0xc3]);
        assert_eq!(parse_hex_bytes("DEADbeef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(parse_hex_bytes("").is_err());
        assert!(parse_hex_bytes("abc").is_err());
        assert!(parse_hex_bytes("zz").is_err());
    }

    #[test]
    fn test_global_options_override_environment()
    {
        let environment = TetherConfig::from_lookup(|name| match name {
            "TETHER_ADDRESS" => Some("10.0.0.1:4014".to_string()),
            "TETHER_TIMEOUT_MS" => Some("9000".to_string()),
            "TETHER_NO_ACK" => Some("1".to_string()),
            _ => None,
        })
        .unwrap();

        let cli = Cli::parse_from(["tether", "--address", "10.0.0.2:9000", "--timeout-ms", "250", "--sequence", "info"]);
        let config = apply_overrides(&cli, environment).unwrap();
        assert_eq!(config.address, SocketAddress::new([10, 0, 0, 2], 9000));
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert!(config.sequence);
        assert!(config.no_ack);

        let cli = Cli::parse_from(["tether", "info"]);
        assert_eq!(apply_overrides(&cli, environment).unwrap(), environment);

        let cli = Cli::parse_from(["tether", "--address", "nowhere", "info"]);
        assert!(apply_overrides(&cli, environment).is_err());
    }

    #[test]
    fn test_subcommand_arguments()
    {
        let cli = Cli::parse_from(["tether", "memory", "0x2000", "-l", "4"]);
        assert!(matches!(
            cli.command,
            Commands::Memory { address, length: 4 } if address == Address::new(0x2000)
        ));

        let cli = Cli::parse_from(["tether", "serve", "--break-at", "0x1000"]);
        match cli.command {
            Commands::Serve {
                exec_path, break_at, ..
            } => {
                assert_eq!(exec_path, "/sandbox/demo");
                assert_eq!(break_at, Some(Address::new(0x1000)));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_demo_target_layout()
    {
        let host = demo_target();
        assert_eq!(host.peek(Address::new(DEMO_CODE + 0xff), 1), Some(vec![0xc3]));
        assert_eq!(host.peek(Address::new(DEMO_DATA), 5), Some(b"hello".to_vec()));
        assert_eq!(host.protection_at(Address::new(DEMO_CODE)), Some(Protection::READ_EXECUTE));
        assert_eq!(host.registers(DEMO_THREAD).map(|blob| blob.len()), Some(DEMO_REGISTER_BYTES));
    }
}
