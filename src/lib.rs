//! # dyninvoke
//!
//! A dynamic-invocation runtime: symbolic member references resolve into method and
//! variable handles whose calling sequences are synthesized once per shape and shared.
//!
//! ## Feature Flags
//!
//! - `memory-validation`: Tracks atomic and non-atomic accesses per storage location and
//!   warns through `tracing` when the two are mixed or an ordering is invalid.
use clap::{Parser, Subcommand};
use std::process::ExitCode;

pub mod demo;
pub mod error;
pub mod types;
pub mod utils;
pub mod value;
pub mod vm;

pub use error::{InvokeError, InvokeResult};
pub use vm::{Lookup, MethodHandle, Runtime, RuntimeConfig, VarHandle};

use types::BasicType;
use vm::{
    templates::{self, TemplateCache},
    AccessMode, ShapeSignature, TemplateKey,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Dynamic member handles with shape-cached calling templates"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the calling template synthesized for one field shape
    Plan {
        #[arg(long, value_name = "MODE")]
        mode: AccessMode,
        #[arg(long = "static")]
        is_static: bool,
        /// The declaring class may still need initialization
        #[arg(long)]
        init: bool,
        #[arg(long)]
        flat: bool,
        #[arg(long)]
        null_restricted: bool,
        #[arg(long)]
        cast: bool,
        #[arg(long, value_name = "KIND", value_parser = parse_primitive)]
        primitive: Option<BasicType>,
        #[arg(long)]
        json: bool,
    },
    /// Run the walkthrough, then list every template it left in the cache
    Shapes,
    /// Write, read and update a composite value through variable handles
    Demo {
        #[arg(long)]
        json: bool,
    },
}

fn parse_primitive(name: &str) -> Result<BasicType, String> {
    BasicType::from_name(name)
        .filter(|b| *b != BasicType::Void)
        .ok_or_else(|| format!("unknown primitive kind {:?}", name))
}

fn run(command: Command) -> Result<String, Box<dyn std::error::Error>> {
    match command {
        Command::Plan {
            mode,
            is_static,
            init,
            flat,
            null_restricted,
            cast,
            primitive,
            json,
        } => {
            let key = TemplateKey::Field {
                mode,
                shape: ShapeSignature {
                    is_static,
                    needs_init_barrier: init,
                    flattened: flat,
                    null_restricted,
                    needs_cast: cast,
                    primitive,
                },
            };
            let template = templates::synthesize(key)?;
            Ok(if json {
                serde_json::to_string_pretty(&template)?
            } else {
                template.to_string()
            })
        }
        Command::Shapes => {
            let runtime = demo::runtime()?;
            demo::run(&runtime)?;
            let lines = TemplateCache::global()
                .cached_keys()
                .into_iter()
                .map(|key| templates::synthesize(key).map(|t| t.to_string()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(lines.join("\n"))
        }
        Command::Demo { json } => {
            let runtime = demo::runtime()?;
            let report = demo::run(&runtime)?;
            Ok(if json {
                serde_json::to_string_pretty(&report)?
            } else {
                report.to_string()
            })
        }
    }
}

pub fn run_cli() -> ExitCode {
    let args = Args::parse();
    match run(args.command) {
        Ok(output) => {
            println!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(1)
        }
    }
}
