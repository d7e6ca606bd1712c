//! Server process of a `kamado::prefork::Prefork` pool.
//!
//! Binds a loopback port (the first argument, or any free port), announces
//! it on stdout and serves requests until its stdin is closed by the parent.

use std::io::{self, Write};
use std::net::{Ipv4Addr, TcpListener};
use std::thread;

use kamado::prefork::{self, KEY_VAR};

fn main() -> anyhow::Result<()> {
    let port = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 0,
    };

    let key = std::env::var(KEY_VAR).ok().filter(|key| !key.is_empty());

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
    let port = listener.local_addr()?.port();

    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{port}")?;
    stdout.flush()?;
    drop(stdout);

    // Exit together with the parent.
    thread::spawn(|| {
        let _ = io::copy(&mut io::stdin().lock(), &mut io::sink());
        std::process::exit(0);
    });

    prefork::serve(listener, key.as_deref())?;
    Ok(())
}
