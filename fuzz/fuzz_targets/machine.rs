#![no_main]
use libfuzzer_sys::fuzz_target;

use lra64::fuzzing::stream::{run, Scenario};

fuzz_target!(|scenario: Scenario| {
    let _ = env_logger::try_init();
    log::debug!("scenario:\n{:?}", scenario);
    let _cg = run(&scenario).expect("allocation did not succeed");
});
