#![cfg(unix)]

use std::fs;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use kamado::{BuildContext, KeepGoing, Options, State, Task, TaskError};
use tempfile::TempDir;

fn context(dir: &TempDir, timeout: Option<Duration>) -> BuildContext {
    let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
    fs::create_dir_all(root.join("src")).unwrap();

    let options = Options {
        jobs: 2,
        keep_going: KeepGoing::On,
        timeout,
        prefork: Some(Utf8PathBuf::from(env!("CARGO_BIN_EXE_kamado-prefork"))),
        ..Options::default()
    };

    BuildContext::new(root.join("src"), root.join("build"), options).unwrap()
}

#[test]
fn commands_run_through_the_pool() {
    let dir = TempDir::new().unwrap();
    let mut bld = context(&dir, None);

    bld.env_mut().set("GREETING", "hello");
    bld.add_generator("echo", |ctx| {
        let out = ctx.bld("greeting.txt")?;
        ctx.add(Task::shell("echo", "echo ${GREETING} > ${TGT}").output(out))?;
        Ok(())
    });

    let report = bld.execute().unwrap();
    assert!(report.is_success(), "{report}");

    let path = bld.nodes().abspath(bld.bldnode()).join("greeting.txt");
    assert_eq!(fs::read_to_string(path).unwrap().trim(), "hello");
}

#[test]
fn the_secret_is_not_leaked_to_commands() {
    let dir = TempDir::new().unwrap();
    let mut bld = context(&dir, None);

    bld.add_generator("env", |ctx| {
        let out = ctx.bld("env.txt")?;
        ctx.add(Task::shell("env", "env > ${TGT}").output(out))?;
        Ok(())
    });

    let report = bld.execute().unwrap();
    assert!(report.is_success(), "{report}");

    let path = bld.nodes().abspath(bld.bldnode()).join("env.txt");
    let text = fs::read_to_string(path).unwrap();
    assert!(!text.contains(kamado::prefork::KEY_VAR));
}

#[test]
fn slow_command_is_killed_after_timeout() {
    let dir = TempDir::new().unwrap();
    let mut bld = context(&dir, Some(Duration::from_secs(1)));

    bld.add_generator("slow", |ctx| {
        ctx.add(Task::shell("sleep", "sleep 5"))?;
        let out = ctx.bld("fast.txt")?;
        ctx.add(Task::shell("fast", "echo done > ${TGT}").output(out))?;
        Ok(())
    });

    let start = Instant::now();
    let report = bld.execute().unwrap();
    assert!(start.elapsed() < Duration::from_secs(4));

    let slow = report.task("sleep").unwrap();
    assert_eq!(slow.state, State::Crashed);
    assert!(matches!(slow.error, Some(TaskError::Timeout(_))));
    assert_eq!(report.state_of("fast: -> fast.txt"), Some(State::Success));
    assert_eq!(report.exit_code(), 1);
}
