//! Treiber stack protected by hazard pointers

use rookery::{HazardPointer, default_domain};
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::thread;

/// A node in the Treiber stack
struct Node<T> {
    /// Moved out by the popping thread, never dropped with the node
    value: ManuallyDrop<T>,
    /// Immutable once the node is published
    next: *mut Node<T>,
}

/// Lock-free Treiber stack
pub struct TreiberStack<T: 'static> {
    head: AtomicPtr<Node<T>>,
}

// SAFETY: values move between threads through push/pop.
unsafe impl<T: Send> Send for TreiberStack<T> {}
unsafe impl<T: Send> Sync for TreiberStack<T> {}

impl<T: 'static> TreiberStack<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value: ManuallyDrop::new(value),
            next: ptr::null_mut(),
        }));

        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe { (*node).next = head };

            if self
                .head
                .compare_exchange(head, node, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let hazard = HazardPointer::new();
        loop {
            let head = hazard.protect(&self.head);
            if head.is_null() {
                return None;
            }

            // SAFETY: protected, so not reclaimed even if popped meanwhile.
            let next = unsafe { (*head).next };

            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                // Only the winning CAS moves the value out.
                let value = unsafe { ptr::read(&*(*head).value) };
                unsafe { default_domain().retire(head) };
                return Some(value);
            }
        }
    }
}

impl<T: 'static> Drop for TreiberStack<T> {
    fn drop(&mut self) {
        // Drain the stack
        while self.pop().is_some() {}
    }
}

fn main() {
    println!("Treiber Stack Example");
    println!("=====================\n");

    println!("Single-threaded test:");
    {
        let stack = TreiberStack::new();

        stack.push(1);
        stack.push(2);
        stack.push(3);

        assert_eq!(stack.pop(), Some(3));
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);

        println!("Push and pop work correctly.");
    }

    println!("\nStress test (8 threads, 50000 ops each):");
    {
        let stack = Arc::new(TreiberStack::new());
        let mut handles = vec![];

        let start = std::time::Instant::now();

        for thread_id in 0..8 {
            let stack = stack.clone();
            handles.push(thread::spawn(move || {
                for i in 0..50000 {
                    if i % 3 == 0 {
                        stack.push(thread_id * 50000 + i);
                    } else {
                        stack.pop();
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let elapsed = start.elapsed();
        let total_ops = 8 * 50000;
        let ops_per_sec = total_ops as f64 / elapsed.as_secs_f64();

        println!("Completed {} operations in {:?}", total_ops, elapsed);
        println!("Throughput: {:.0} ops/sec", ops_per_sec);
    }

    let freed = rookery::cleanup();
    println!("\nReclaimed {} nodes at the barrier.", freed);
    println!("Slots registered: {}", default_domain().slot_count());
    println!("\nAll tests passed!");
}
