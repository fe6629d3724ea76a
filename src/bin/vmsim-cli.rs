//! vmsim CLI - paging workout
//!
//! Run with: cargo run --bin vmsim-cli -- [config.json]
//!
//! Starts a few demand-paged processes that together touch more pages than
//! the machine has frames, has each one write and verify a pattern from its
//! own thread, and prints the paging statistics.

use std::sync::Arc;
use std::thread;
use vmsim::kernel::{AddressSpace, Kernel, PagedProcess, ProgramImage, Result, VmConfig};

const WORKERS: usize = 3;
const ROUNDS: usize = 4;

fn load_config() -> std::result::Result<VmConfig, String> {
    match std::env::args().nth(1) {
        None => Ok(VmConfig::default()),
        Some(path) => {
            let text =
                std::fs::read_to_string(&path).map_err(|e| format!("{}: {}", path, e))?;
            VmConfig::from_json(&text).map_err(|e| format!("{}: {}", path, e))
        }
    }
}

fn pattern(worker: usize, round: usize, offset: usize) -> u8 {
    (worker * 31 + round * 7 + offset) as u8
}

/// Fill everything above the image with a pattern, then read it back
fn workout(worker: usize, process: &PagedProcess) -> Result<usize> {
    let layout = process.layout();
    let page_size = process.page_size();
    let start = layout.image_pages * page_size;
    let len = layout.stack_pages * page_size;
    let mut mismatches = 0;

    for round in 0..ROUNDS {
        let data: Vec<u8> = (0..len).map(|i| pattern(worker, round, i)).collect();
        process.write_memory(start, &data)?;

        let mut back = vec![0u8; len];
        process.read_memory(start, &mut back)?;
        mismatches += back.iter().zip(&data).filter(|(a, b)| a != b).count();
    }

    if let Some(name) = process.read_string(layout.argv + 4 * layout.argc, 32)? {
        vmsim::console_log!("[{}] {} done", process.pid(), name);
    }
    Ok(mismatches)
}

fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("vmsim: {}", e);
            std::process::exit(1);
        }
    };
    vmsim::logger::init(config.log_level);

    println!(
        "vmsim v0.1.0: {} frames of {} bytes, {} stack pages",
        config.num_frames, config.page_size, config.stack_pages
    );

    let kernel = match Kernel::new(config) {
        Ok(kernel) => kernel,
        Err(e) => {
            eprintln!("vmsim: {}", e);
            std::process::exit(1);
        }
    };

    let page_size = kernel.vm().page_size();
    let text: Vec<u8> = (0..page_size).map(|i| i as u8).collect();
    let image = match ProgramImage::from_segments(
        page_size,
        &[("text", &text[..], true), ("data", &b"vmsim"[..], false)],
    ) {
        Ok(image) => Arc::new(image),
        Err(e) => {
            eprintln!("vmsim: {}", e);
            std::process::exit(1);
        }
    };

    let mut handles = Vec::new();
    for worker in 0..WORKERS {
        let name = format!("worker{}", worker);
        let process = match kernel.spawn_paged(image.clone(), &[name.as_str()]) {
            Ok(process) => process,
            Err(e) => {
                eprintln!("vmsim: spawn {}: {}", name, e);
                std::process::exit(1);
            }
        };
        handles.push(thread::spawn(move || workout(worker, &process)));
    }

    let mut failed = false;
    for (worker, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(0)) => {}
            Ok(Ok(bad)) => {
                eprintln!("worker{}: {} bytes read back wrong", worker, bad);
                failed = true;
            }
            Ok(Err(e)) => {
                eprintln!("worker{}: {}", worker, e);
                failed = true;
            }
            Err(_) => {
                eprintln!("worker{}: panicked", worker);
                failed = true;
            }
        }
    }

    println!();
    print!("{}", kernel.summary());
    println!("Free frames: {}/{}", kernel.free_frames(), kernel.vm().num_frames());

    if failed {
        std::process::exit(1);
    }
}
