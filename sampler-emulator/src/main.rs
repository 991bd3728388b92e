mod session;

use std::env;
use std::io::{self, BufRead, Write};
use std::process;

use session::Session;

fn main() -> io::Result<()> {
    let seed = parse_seed().unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("Usage: sampler-emulator [--seed <u64>]");
        process::exit(2);
    });

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    let mut session = Session::new(seed);
    let mut line = String::new();

    writeln!(
        writer,
        "Sampler emulator ready. Type `help` for commands or `exit` to quit."
    )?;

    loop {
        line.clear();
        write!(writer, "> ")?;
        writer.flush()?;

        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            writeln!(writer)?;
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if should_terminate(trimmed) {
            writeln!(writer, "Session closed.")?;
            break;
        }

        for response in session.handle_line(trimmed) {
            writeln!(writer, "{response}")?;
        }
    }

    Ok(())
}

fn should_terminate(input: &str) -> bool {
    input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}

fn parse_seed() -> Result<u64, String> {
    let mut args = env::args().skip(1);
    if let Some(arg) = args.next() {
        if let Some(value) = arg.strip_prefix("--seed=") {
            value
                .parse()
                .map_err(|_| format!("Invalid seed `{value}`"))
        } else if arg == "--seed" {
            if let Some(value) = args.next() {
                value
                    .parse()
                    .map_err(|_| format!("Invalid seed `{value}`"))
            } else {
                Err("Expected value after --seed".to_string())
            }
        } else {
            Err(format!("Unknown argument `{arg}`"))
        }
    } else {
        Ok(0x5a5a_1234)
    }
}
