//! tilecq: command queue and dispatch emulator for a tile-based accelerator
//!
//! Runs a small demo workload against the emulated device: a buffer write,
//! a multi-core program launch, and a readback, then prints the device
//! trace and dispatch statistics.

use std::env;
use std::time::Duration;

use tilecq::config::Config;
use tilecq::cq::{Buffer, CqMode, CqOptions};
use tilecq::device::{CoreCoord, CoreRange, CoreRangeSet, TraceEvent};
use tilecq::emu::{Device, DeviceOptions};
use tilecq::program::{Kernel, ProcessorClass, Program};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--sample-config") {
        print!("{}", Config::sample_config());
        if let Some(path) = Config::user_config_path() {
            eprintln!("# user config path: {}", path.display());
        }
        return Ok(());
    }

    let show_trace = args.iter().any(|a| a == "--trace" || a == "-t");
    let async_mode = args.iter().any(|a| a == "--async");
    let mut launches = 4usize;
    for arg in &args[1..] {
        if let Some(n) = arg.strip_prefix("--launches=") {
            launches = n.parse()?;
        }
    }

    let config = Config::get();
    let opts = DeviceOptions::from_config(config);
    let grid = opts.grid;
    println!(
        "tilecq: {}x{} worker grid, {} KiB issue ring, launch ring depth {}",
        grid.cols,
        grid.rows,
        opts.ring_size / 1024,
        opts.launch_entries
    );

    let device = Device::start(opts);
    let mut cq = device.command_queue(CqOptions {
        mode: if async_mode { CqMode::Async } else { CqMode::Sync },
        finish_timeout: Duration::from_millis(config.finish_timeout_ms()),
        ..CqOptions::default()
    });

    // A buffer round-trip through device DRAM.
    let payload: Vec<u8> = (0..4096u32).flat_map(|i| i.to_le_bytes()).collect();
    let buffer = Buffer { address: 0x10_0000, size: payload.len() as u64, page_size: 4096 };
    cq.enqueue_write_buffer(&buffer, &payload, false)?;

    // A two-kernel program on a 2x2 rectangle.
    let cores = CoreRangeSet::new(vec![CoreRange::new(
        CoreCoord::new(0, 0),
        CoreCoord::new(1.min(grid.cols - 1), 1.min(grid.rows - 1)),
    )]);
    for launch in 0..launches {
        let mut program = Program::new();
        program.add_kernel(
            Kernel::new("demo_reader", ProcessorClass::Dm0, demo_binary(0xA0), cores.clone()),
            &grid,
        )?;
        program.add_kernel(
            Kernel::new("demo_math", ProcessorClass::Compute, demo_binary(0xC0), cores.clone()),
            &grid,
        )?;
        program.set_runtime_args(CoreCoord::new(0, 0), ProcessorClass::Dm0, vec![launch as u32, 0xFEED]);
        cq.enqueue_program(&program, false)?;
    }

    cq.finish()?;
    let readback = cq.enqueue_read_buffer(&buffer)?;
    anyhow::ensure!(readback == payload, "readback mismatch");

    device.with_engine(|engine| {
        let state = &engine.state;
        println!();
        println!("Dispatch summary");
        println!("================");
        println!("engine cycles:    {}", engine.cycle());
        println!("commands fetched: {}", state.count_trace(|e| matches!(e, TraceEvent::CommandFetched { .. })));
        println!("ring wraps:       {}", state.count_trace(|e| matches!(e, TraceEvent::Wrap { .. })));
        println!("launches sent:    {}", state.count_trace(|e| matches!(e, TraceEvent::LaunchSent { .. })));
        println!("kernel calls:     {}", state.count_trace(|e| matches!(e, TraceEvent::KernelCall { .. })));
        println!("worker acks:      {}", state.count_trace(|e| matches!(e, TraceEvent::AckSent { .. })));
        println!("dram pages:       {}", state.dram.resident_pages());

        if show_trace {
            println!();
            println!("Trace");
            println!("=====");
            for (i, event) in state.trace.iter().enumerate() {
                println!("  [{i:4}] {event:?}");
            }
        }
    });

    println!();
    println!("readback OK ({} bytes)", readback.len());
    Ok(())
}

/// A recognizable fake kernel image.
fn demo_binary(tag: u8) -> Vec<u8> {
    let mut binary = vec![tag; 256];
    binary[0..4].copy_from_slice(&0x6Fu32.to_le_bytes());
    binary
}
