//! PaxKV interactive command-line client executable.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::str::SplitWhitespace;

use clap::Parser;

use color_print::{cprint, cprintln};

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::time::Instant;

use paxkv::{pf_error, ClientOp, ClientStub, Key, PaxKvError};

/// Prompt string at the start of line.
const PROMPT: &str = ">>>>> ";

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Address of the server replica's API port to connect to.
    #[arg(short, long, default_value = "127.0.0.1:52700")]
    server: SocketAddr,

    /// Optional one-shot command; if absent, enters the REPL loop.
    /// Example: 'put 7'.
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

/// Recognizable command types.
enum ReplCommand {
    /// Normal key-value operation.
    Op(ClientOp),

    /// Print help message.
    PrintHelp,

    /// Client exit.
    Exit,

    /// Nothing read.
    Nothing,
}

/// Interactive REPL-style client struct.
struct ClientRepl {
    /// Connection stub to a server replica.
    stub: ClientStub,

    /// User input buffer.
    input_buf: String,
}

impl ClientRepl {
    /// Creates a new REPL-style client.
    fn new(stub: ClientStub) -> Self {
        ClientRepl {
            stub,
            input_buf: String::new(),
        }
    }

    /// Prints the prompt string.
    #[inline]
    fn print_prompt() {
        cprint!("<bright-yellow>{}</>", PROMPT);
        io::stdout().flush().unwrap();
    }

    /// Prints (optionally) an error message and the help message.
    fn print_help(err: Option<&PaxKvError>) {
        if let Some(e) = err {
            cprintln!("<bright-red>✗</> {}", e);
        }
        println!("HELP: Supported commands:");
        println!("          get <key>");
        println!("          put <key>");
        println!("          del <key>");
        println!("          help");
        println!("          exit");
        println!("      Keys are non-negative integers");
        io::stdout().flush().unwrap();
    }

    /// Expect to get the next segment string from parsed segs.
    #[inline]
    fn expect_next_seg<'s>(
        segs: &mut SplitWhitespace<'s>,
    ) -> Result<&'s str, PaxKvError> {
        if let Some(seg) = segs.next() {
            Ok(seg)
        } else {
            let err = PaxKvError::msg("not enough args");
            Self::print_help(Some(&err));
            Err(err)
        }
    }

    /// Parses one command line into a REPL command.
    fn parse_command(line: &str) -> Result<ReplCommand, PaxKvError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(ReplCommand::Nothing);
        }

        // split input line by whitespaces, getting an iterator of segments
        let mut segs = line.split_whitespace();

        // get command type, match case-insensitively
        let cmd_type = segs.next();
        debug_assert!(cmd_type.is_some());

        match &cmd_type.unwrap().to_lowercase()[..] {
            "get" => {
                let key: Key = Self::expect_next_seg(&mut segs)?.parse()?;
                Ok(ReplCommand::Op(ClientOp::Get { key }))
            }

            "put" => {
                let key: Key = Self::expect_next_seg(&mut segs)?.parse()?;
                Ok(ReplCommand::Op(ClientOp::Put { key }))
            }

            "del" | "delete" => {
                let key: Key = Self::expect_next_seg(&mut segs)?.parse()?;
                Ok(ReplCommand::Op(ClientOp::Delete { key }))
            }

            "help" => Ok(ReplCommand::PrintHelp),

            "exit" => Ok(ReplCommand::Exit),

            _ => {
                let err = PaxKvError(format!(
                    "unrecognized command: {}",
                    cmd_type.unwrap()
                ));
                Self::print_help(Some(&err));
                Err(err)
            }
        }
    }

    /// Reads in user input and parses into a command.
    fn read_command(&mut self) -> Result<ReplCommand, PaxKvError> {
        self.input_buf.clear();
        let nread = io::stdin().read_line(&mut self.input_buf)?;
        if nread == 0 {
            return Ok(ReplCommand::Exit);
        }
        Self::parse_command(&self.input_buf)
    }

    /// Issues the operation to the service and prints the result.
    async fn eval_op(&mut self, op: ClientOp) -> Result<(), PaxKvError> {
        let start = Instant::now();
        let result = self.stub.issue(op).await?;
        let lat_ms = start.elapsed().as_secs_f64() * 1000.0;
        cprintln!("<bright-green>✓</> {} <<took {:.2} ms>>", result, lat_ms);
        io::stdout().flush().unwrap();
        Ok(())
    }

    /// One iteration of the REPL loop. On success, returns a boolean that's
    /// false only when exiting.
    async fn iter(&mut self) -> Result<bool, PaxKvError> {
        Self::print_prompt();

        let cmd = self.read_command()?;
        match cmd {
            ReplCommand::Exit => {
                println!("Exiting...");
                Ok(false)
            }

            ReplCommand::Nothing => Ok(true),

            ReplCommand::PrintHelp => {
                Self::print_help(None);
                Ok(true)
            }

            ReplCommand::Op(op) => {
                self.eval_op(op).await?;
                Ok(true)
            }
        }
    }

    /// Runs the infinite REPL loop.
    async fn run(&mut self) -> Result<(), PaxKvError> {
        loop {
            match self.iter().await {
                Ok(true) => {}

                Ok(false) => break,

                Err(err) => {
                    cprintln!("<bright-red>✗</> error: {}", err);
                }
            }
        }

        Ok(())
    }
}

// Client executable main entrance.
fn client_main() -> Result<(), PaxKvError> {
    let args = CliArgs::parse();

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("tokio-worker-client")
        .build()?;

    runtime.block_on(async move {
        let stub = ClientStub::new_by_connect(args.server).await?;
        let mut repl = ClientRepl::new(stub);

        if args.command.is_empty() {
            repl.run().await
        } else {
            // one-shot mode
            match ClientRepl::parse_command(&args.command.join(" "))? {
                ReplCommand::Op(op) => repl.eval_op(op).await,
                _ => Ok(()),
            }
        }
    })
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = client_main() {
        pf_error!("c"; "client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
