use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use ocmctor::{
    ConflictPolicy, ConstructionEngine, ConstructorSpec, EngineOptions, InputMethodRegistry,
};
use ocmrepo::provider::RepositoryProvider;
use ocmmodel::repospec::RepositorySpec;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// constructor spec (yaml)
    constructor: PathBuf,

    /// target repository spec (yaml), e.g. a CommonTransportFormat/v1 doc
    #[arg(long)]
    repository: PathBuf,

    #[arg(long, default_value = "4")]
    concurrency: usize,

    /// abort-and-fail | skip | replace
    #[arg(long, default_value = "abort-and-fail")]
    conflict_policy: ConflictPolicy,

    #[arg(long)]
    skip_reference_digest_processing: bool,

    /// relative file inputs resolve against this
    #[arg(long)]
    working_directory: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    let args = Args::parse();

    let constructor =
        ConstructorSpec::from_yaml(&std::fs::read_to_string(&args.constructor).unwrap()).unwrap();
    let repo_spec =
        RepositorySpec::from_yaml(&std::fs::read_to_string(&args.repository).unwrap()).unwrap();

    let provider = Arc::new(RepositoryProvider::new(None).unwrap());
    let target = provider.get_repository(&repo_spec).await.unwrap();

    let mut inputs = InputMethodRegistry::new();
    if let Some(dir) = &args.working_directory {
        inputs = inputs.with_working_directory(dir);
    }

    let engine = ConstructionEngine::new(target)
        .with_inputs(inputs)
        .with_options(EngineOptions {
            concurrency_limit: args.concurrency,
            conflict_policy: args.conflict_policy,
            skip_reference_digest_processing: args.skip_reference_digest_processing,
        });

    match engine.construct(&constructor).await {
        Ok(result) => {
            for d in &result.committed {
                println!("committed {}:{}", d.name(), d.version());
            }
            for (name, version) in &result.skipped {
                println!("skipped {}:{}", name, version);
            }
        }
        Err(e) => {
            eprintln!("construction failed: {e}");
            std::process::exit(1);
        }
    }
}
