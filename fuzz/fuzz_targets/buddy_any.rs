#![no_main]

use alloc_hater::{AllocatorOp, Evaluator};
use arbitrary::Arbitrary;
use buddy_sim_hater::BuddySubject;
use libfuzzer_sys::fuzz_target;

const MAX_CAPACITY: usize = 1 << 20;

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    capacity: usize,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    // Zero capacities exercise the constructor error path.
    let subject = match BuddySubject::new(args.capacity % MAX_CAPACITY) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = Evaluator::new(subject);
    if let Err(failed) = eval.evaluate(args.ops) {
        panic!("{failed:#?}");
    }
});
