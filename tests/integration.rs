use std::{env, fs, path::PathBuf, process::Command};

fn run_bin(args: &[&str]) -> bool {
    let bin = PathBuf::from(env!("CARGO_BIN_EXE_ribosim"));

    let output = Command::new(bin)
        .args(args)
        .output()
        .expect("failed to execute command");

    if !output.status.success() {
        let stderr_str =
            std::str::from_utf8(&output.stderr).expect("failed to convert stderr to string");
        eprintln!("binary failed with {args:?}\nstderr:\n{stderr_str}");
    }
    output.status.success()
}

fn setup(name: &str, config_contents: &str) -> PathBuf {
    let test_dir = PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join(name);

    fs::remove_dir_all(&test_dir).ok();
    fs::create_dir(&test_dir).expect("failed to create test directory");

    fs::write(test_dir.join("config.toml"), config_contents).expect("failed to write config file");

    test_dir
}

#[test]
fn basic_workflow() {
    let config_contents = String::new()
        + "[model]\n"
        + "footprint = 3\n"
        + "alpha = 0.3\n"
        + "rates = { n_sites = 30, elongation = 1.0, termination = 0.8 }\n"
        + "\n"
        + "[run]\n"
        + "n_traj = 8\n"
        + "seed = 12345\n"
        + "n_threads = 2\n"
        + "audit_every = 128\n"
        + "\n"
        + "[steady]\n"
        + "t_max = 400.0\n"
        + "steps_per_check = 200\n"
        + "tolerance = 0.05\n"
        + "\n"
        + "[transient]\n"
        + "t_max = 40.0\n"
        + "n_bins = 64\n";
    let test_dir = setup("basic_workflow", &config_contents);
    let test_dir_str = test_dir
        .to_str()
        .expect("failed to convert test directory to string");

    assert!(run_bin(&["--sim-dir", test_dir_str, "transient"]));
    assert!(run_bin(&["--sim-dir", test_dir_str, "steady"]));

    assert!(test_dir.join("run-0000").join("transient.msgpack").is_file());
    assert!(test_dir.join("run-0001").join("steady.msgpack").is_file());

    assert!(run_bin(&["--sim-dir", test_dir_str, "clean"]));
    assert!(!test_dir.join("run-0000").exists());
    assert!(!test_dir.join("run-0001").exists());

    fs::remove_dir_all(&test_dir).ok();
}

#[test]
fn rejects_bad_config() {
    let config_contents = String::new()
        + "[model]\n"
        + "footprint = 4\n"
        + "alpha = 0.3\n"
        + "rates = { n_sites = 8, elongation = 1.0, termination = 1.0 }\n"
        + "\n"
        + "[run]\n"
        + "n_traj = 4\n"
        + "\n"
        + "[transient]\n"
        + "t_max = 10.0\n"
        + "n_bins = 16\n";
    let test_dir = setup("rejects_bad_config", &config_contents);
    let test_dir_str = test_dir
        .to_str()
        .expect("failed to convert test directory to string");

    assert!(!run_bin(&["--sim-dir", test_dir_str, "transient"]));
    assert!(!test_dir.join("run-0000").exists());

    fs::remove_dir_all(&test_dir).ok();
}

#[test]
fn missing_section_fails() {
    let config_contents = String::new()
        + "[model]\n"
        + "footprint = 1\n"
        + "alpha = 0.5\n"
        + "rates = [0.0, 1.0, 1.0, 1.0, 1.0]\n"
        + "\n"
        + "[run]\n"
        + "n_traj = 2\n"
        + "seed = 1\n"
        + "\n"
        + "[transient]\n"
        + "t_max = 5.0\n"
        + "n_bins = 8\n";
    let test_dir = setup("missing_section_fails", &config_contents);
    let test_dir_str = test_dir
        .to_str()
        .expect("failed to convert test directory to string");

    assert!(!run_bin(&["--sim-dir", test_dir_str, "steady"]));
    assert!(run_bin(&["--sim-dir", test_dir_str, "transient"]));
    assert!(test_dir.join("run-0000").join("transient.msgpack").is_file());

    fs::remove_dir_all(&test_dir).ok();
}
