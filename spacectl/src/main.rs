use clap::{Parser as ClapParser, ValueEnum};
use log::{info, warn};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::{process, thread, time::Instant};

use spaces::{
    Address, AllocationResult, AllocationSpace, HeapObject, Heap, HeapObjectIterator,
    HeapSettings, LargeObjectIterator, LocalAllocationBuffer, SemiSpaceIterator, WORD_SIZE,
    object_size_for,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum SpaceArg {
    New,
    Old,
    Map,
    Code,
}

impl From<SpaceArg> for AllocationSpace {
    fn from(space: SpaceArg) -> Self {
        match space {
            SpaceArg::New => AllocationSpace::New,
            SpaceArg::Old => AllocationSpace::Old,
            SpaceArg::Map => AllocationSpace::Map,
            SpaceArg::Code => AllocationSpace::Code,
        }
    }
}

#[derive(ClapParser, Debug)]
#[command(author, version, about = "Drive an allocation workload against a heap", long_about = None)]
struct Cli {
    /// Page size in KiB (power of two)
    #[arg(long, default_value_t = 256)]
    page_size_kib: usize,

    /// Page arena capacity in MiB
    #[arg(long, default_value_t = 64)]
    capacity_mib: usize,

    /// Initial pages per semispace
    #[arg(long, default_value_t = 1)]
    semi_space_pages: usize,

    /// Maximum pages per semispace
    #[arg(long, default_value_t = 8)]
    max_semi_space_pages: usize,

    /// Target space of the workload
    #[arg(long, value_enum, default_value_t = SpaceArg::Old)]
    space: SpaceArg,

    /// Objects to allocate per thread
    #[arg(long, default_value_t = 10_000)]
    objects: usize,

    #[arg(long, default_value_t = 16)]
    min_size: usize,

    #[arg(long, default_value_t = 256)]
    max_size: usize,

    /// Alignment of every object (power of two, at least 8)
    #[arg(long, default_value_t = 8)]
    align: usize,

    /// Worker threads using the synchronized entry points
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Allocate through local allocation buffers
    #[arg(long)]
    lab: bool,

    /// Free every other object afterwards and allocate them again
    #[arg(long, help = "Exercise the free list (old, map and code only)")]
    sweep: bool,

    /// Run the workload with black allocation active
    #[arg(long)]
    black: bool,

    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,

    /// Log slow-path events
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn settings(&self) -> HeapSettings {
        HeapSettings {
            page_size: self.page_size_kib * 1024,
            capacity: self.capacity_mib * 1024 * 1024,
            semi_space_initial_pages: self.semi_space_pages,
            semi_space_max_pages: self.max_semi_space_pages,
            ..Default::default()
        }
    }
}

/// Objects a worker allocated, as (address, size).
type Allocated = Vec<(Address, usize)>;

fn run_worker(heap: &Heap, cli: &Cli, index: usize) -> Allocated {
    let mut rng = StdRng::seed_from_u64(cli.seed.wrapping_add(index as u64));
    let space = AllocationSpace::from(cli.space);
    let mut allocated = Vec::with_capacity(cli.objects);
    let mut lab = if cli.lab {
        heap.new_lab(space)
    } else {
        LocalAllocationBuffer::invalid()
    };

    for _ in 0..cli.objects {
        let size = object_size_for(rng.gen_range(cli.min_size..=cli.max_size).max(WORD_SIZE));
        let addr = if cli.lab {
            allocate_in_lab(heap, &mut lab, space, size, cli.align)
        } else {
            heap.allocate_object(size, space, cli.align).address()
        };
        let Some(addr) = addr else {
            warn!(
                "worker {index}: {space} space exhausted after {} objects",
                allocated.len()
            );
            break;
        };
        allocated.push((addr, size));
    }
    allocated
}

fn allocate_in_lab(
    heap: &Heap,
    lab: &mut LocalAllocationBuffer,
    space: AllocationSpace,
    size: usize,
    align: usize,
) -> Option<Address> {
    let addr = match lab.allocate_raw_aligned(size, align) {
        Some(addr) => addr,
        None => {
            if size + align > heap.settings().lab_size {
                return heap.allocate_object(size, space, align).address();
            }
            *lab = heap.new_lab(space);
            lab.allocate_raw_aligned(size, align)?
        }
    };
    // SAFETY: the range was just handed out by the buffer
    unsafe { HeapObject::initialize(addr, size) };
    Some(addr)
}

fn sweep(heap: &Heap, space: AllocationSpace, objects: &[(Address, usize)], align: usize) {
    let Some(paged) = heap.paged_space(space) else {
        warn!("--sweep needs an old-generation space, skipping");
        return;
    };
    paged.close_allocation_window();

    let mut freed = 0;
    for &(addr, size) in objects.iter().step_by(2) {
        if !paged.contains(addr) {
            continue;
        }
        paged.free(addr, size);
        freed += 1;
    }
    info!("swept {freed} objects, {} bytes on the free list", paged.available());

    let mut reused = 0;
    for &(_, size) in objects.iter().step_by(2) {
        match heap.allocate_object(size, space, align) {
            AllocationResult::Success(_) => reused += 1,
            AllocationResult::Retry(space) => {
                warn!("{space} space exhausted while refilling");
                break;
            }
        }
    }
    println!("sweep: freed {freed}, reallocated {reused}");
}

fn walk(heap: &Heap) {
    let count = |iter: &mut dyn Iterator<Item = HeapObject>| iter.count();
    println!(
        "objects: new {} old {} map {} code {} large {}",
        count(&mut SemiSpaceIterator::new(heap.new_space())),
        count(&mut HeapObjectIterator::new(heap.old_space())),
        count(&mut HeapObjectIterator::new(heap.map_space())),
        count(&mut HeapObjectIterator::new(heap.code_space())),
        count(&mut LargeObjectIterator::new(heap.lo_space())),
    );
    println!("chunks: {}", heap.chunks().count());
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if cli.min_size == 0 || cli.min_size > cli.max_size {
        eprintln!("error: need 0 < --min-size <= --max-size");
        process::exit(2);
    }
    if !cli.align.is_power_of_two() || cli.align < WORD_SIZE {
        eprintln!("error: --align must be a power of two >= {WORD_SIZE}");
        process::exit(2);
    }

    let heap = match Heap::new(cli.settings()) {
        Ok(heap) => heap,
        Err(err) => {
            eprintln!("error: {err}");
            process::exit(1);
        }
    };
    if cli.black {
        heap.marking().start_black_allocation();
    }

    let start = Instant::now();
    let allocated: Vec<Allocated> = thread::scope(|scope| {
        let handles = (0..cli.threads.max(1))
            .map(|index| {
                let heap = &heap;
                let cli = &cli;
                scope.spawn(move || run_worker(heap, cli, index))
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_default())
            .collect()
    });
    let elapsed = start.elapsed();
    let total = allocated.iter().map(Vec::len).sum::<usize>();
    println!(
        "allocated {total} objects on {} threads in {elapsed:?}",
        cli.threads.max(1)
    );

    if cli.black {
        heap.marking().finish_black_allocation();
    }
    if cli.sweep {
        let objects = allocated.concat();
        sweep(&heap, cli.space.into(), &objects, cli.align);
    }

    walk(&heap);
    println!("{}", heap.stats());
}
