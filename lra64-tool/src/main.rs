use arbitrary::{Arbitrary, Unstructured};
use clap::Parser;
use lra64::fuzzing::stream::{run, Scenario};
use lra64::inst::Op;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

#[derive(Parser)]
/// Tool for exercising lra64 on randomly generated streams.
struct Args {
    /// Print the allocated instruction stream.
    #[clap(short = 'v')]
    verbose: bool,

    /// Seed for the scenario generator.
    #[clap(long, default_value_t = 0)]
    seed: u64,

    /// Bytes of fuel for the scenario generator.
    #[clap(long, default_value_t = 8192)]
    size: usize,
}

fn main() {
    pretty_env_logger::init();
    let args = Args::parse();

    let scenario = create_random_scenario(args.seed, args.size);
    let cg = run(&scenario).expect("allocation did not succeed");

    if args.verbose {
        for inst in cg.insts.iter() {
            println!("    {}", cg.insts.get(inst));
        }
    }

    let count = |op: Op| {
        cg.insts
            .iter()
            .filter(|&inst| cg.insts.get(inst).op() == op)
            .count()
    };
    let loads = count(Op::LdrImmX) + count(Op::VLdrImmD);
    let stores = count(Op::StrImmX) + count(Op::VStrImmD);
    let moves = count(Op::OrrX) + count(Op::EorX) + count(Op::FMovD);
    println!(
        "{} instructions, {} virtuals, {} spill slots ({} loads, {} stores, {} moves)",
        cg.insts.len(),
        cg.vregs.len(),
        cg.spills.num_slots(),
        loads,
        stores,
        moves,
    );
}

fn create_random_scenario(seed: u64, size: usize) -> Scenario {
    let mut bytes: Vec<u8> = vec![];
    bytes.resize(size, 0);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.fill(&mut bytes[..]);
    loop {
        let mut u = Unstructured::new(&bytes[..]);
        match Scenario::arbitrary(&mut u) {
            Ok(scenario) => {
                return scenario;
            }
            Err(arbitrary::Error::NotEnoughData) => {
                let len = bytes.len();
                bytes.resize(len + 1024, 0);
                rng.fill(&mut bytes[len..]);
            }
            Err(e) => panic!("unexpected error: {:?}", e),
        }
    }
}
