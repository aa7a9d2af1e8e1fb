use std::collections::HashMap;

use clap::Parser;
use serde::{Deserialize, Serialize};

use batchd::client::Client;
use batchd::remote_fn::FunctionRegistry;
use batchd::scheduler::Task;

#[derive(Parser, Debug)]
#[command(name = "submit-task")]
#[command(about = "Submit example tasks to a batchd server")]
struct Args {
    /// Server socket
    #[arg(long, default_value = "batchd.sock")]
    socket: String,

    /// Number of remote function calls to fan out
    #[arg(long, default_value = "4")]
    count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    index: u64,
}

fn registry() -> Result<FunctionRegistry, Box<dyn std::error::Error>> {
    let mut registry = FunctionRegistry::new();
    registry.register("greet", |greeting: Greeting| {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
        println!("hello #{} from {}", greeting.index, host);
        Ok::<_, String>(())
    })?;
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // On a worker this process is re-entered with an invocation instead of
    // the normal arguments.
    let registry = registry()?;
    if let Some(outcome) = registry.dispatch(std::env::args()) {
        std::process::exit(if outcome.is_ok() { 0 } else { 1 });
    }

    let args = Args::parse();
    let client = Client::connect(&args.socket).await?;

    let result = client
        .run(Task::new("/bin/echo", "$X").with_env("X", "hi"))
        .await?;
    println!("echo exited with {}: {}", result.code, result.output.trim_end());

    let greetings: Vec<Greeting> = (0..args.count).map(|index| Greeting { index }).collect();
    let results = client.map_func(HashMap::new(), "greet", &greetings).await;
    for (greeting, result) in greetings.iter().zip(results) {
        println!("[{}] code={} {}", greeting.index, result.code, result.output.trim_end());
    }

    Ok(())
}
