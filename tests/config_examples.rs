use std::{fs, path::PathBuf};

use autodemo::config::Config;

#[test]
fn bundled_demo_configs_parse_and_cover_both_sink_modes() {
    let demos_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos");
    let entries = fs::read_dir(&demos_dir).expect("demos directory should exist");

    let mut parsed_count = 0usize;
    let mut has_local_worker_with_hooks = false;
    let mut has_remote_worker = false;

    for entry in entries {
        let entry = entry.expect("directory entry should be readable");
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
            continue;
        }

        let config = Config::from_path(&path)
            .unwrap_or_else(|err| panic!("demo config {} should parse: {err}", path.display()));
        parsed_count += 1;
        assert!(
            !config.proxies.is_empty(),
            "demo config {} should declare at least one proxy",
            path.display()
        );
        match config.session.worker_url {
            Some(_) => has_remote_worker = true,
            None if config.worker.hooks.postprocess.is_some() => {
                has_local_worker_with_hooks = true
            }
            None => {}
        }
    }

    assert!(parsed_count >= 2, "expected at least two TOML demo configs");
    assert!(
        has_local_worker_with_hooks,
        "expected a demo config running the worker locally with hooks"
    );
    assert!(
        has_remote_worker,
        "expected a demo config pointing at a remote worker"
    );
}
