//! This is a very minimal example to show using the HeapGrower functions, and
//! a `RawAlloc` on top of them.

use segalloc::allocators::{HeapGrower, RawAlloc};
use segalloc::unix::MmapHeapGrower;

fn main() {
    env_logger::init();

    // MmapHeapGrower reserves virtual memory with mmap on first use.
    let mut grower = MmapHeapGrower::new(1 << 20);
    let p = grower.grow_heap(64).unwrap();
    println!("Returned: ({:p}={}, 64)", p, p.as_ptr() as usize);
    println!(
        "Heap: {:p}..{:p}, {} pages in use",
        grower.low_bound(),
        grower.high_bound(),
        grower.pages()
    );

    let mut heap = RawAlloc::new(MmapHeapGrower::default());
    let pointers: Vec<*mut u8> = [24, 100, 2000].iter().map(|&n| heap.allocate(n)).collect();
    println!("\nAfter three allocations:\n{}", heap);

    unsafe { heap.release(pointers[1]) };
    println!("\nAfter releasing the second:\n{}", heap);
    println!("\nStats: {:?}", heap.check_heap(false).unwrap());
}
