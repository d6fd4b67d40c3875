#![no_main]

use alloc_hater::{AllocatorOp, Evaluator};
use arbitrary::Arbitrary;
use buddy_sim_hater::BuddySubject;
use libfuzzer_sys::fuzz_target;

const MAX_ORDER: u8 = 20;

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    order: u8,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    let capacity = 1 << (args.order % (MAX_ORDER + 1));
    let subject = match BuddySubject::new(capacity) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = Evaluator::new(subject);
    if let Err(failed) = eval.evaluate(args.ops) {
        panic!("{failed:#?}");
    }
});
