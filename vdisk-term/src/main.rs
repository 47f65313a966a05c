mod cli;
mod shell;

use std::error::Error;
use std::io::{self, BufRead, Write};

use clap::Parser;
use cli::Cli;
use log::info;
use shell::{Outcome, Shell};
use vdisk::io::FileStore;
use vdisk::Filesystem;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let store = FileStore::new(&cli.store);
    info!("Using volume at {}.", store.path().display());
    let fs = if cli.format {
        Filesystem::create(store, cli.config())?
    } else {
        Filesystem::open_or_create(store, cli.config())?
    };
    let mut shell = Shell::new(fs);

    if let Some(command) = &cli.command {
        if let Outcome::Output(text) = shell.execute(command) {
            if !text.is_empty() {
                println!("{}", text);
            }
        }
        return Ok(());
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut line = String::new();
    loop {
        write!(stdout, "{}", shell.prompt())?;
        stdout.flush()?;

        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            writeln!(stdout)?;
            break;
        }
        match shell.execute(&line) {
            Outcome::Output(text) if text.is_empty() => {}
            Outcome::Output(text) => writeln!(stdout, "{}", text)?,
            Outcome::Exit => break,
        }
    }
    Ok(())
}
