use ga_report_core::{Aggregator, StatStore, UrlStat, ALL_PERIOD};
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    base: PathBuf,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
    xdg_runtime: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");
        let xdg_runtime = base.join("xdg-runtime");

        for dir in [&home, &xdg_data, &xdg_config, &xdg_state, &xdg_runtime] {
            fs::create_dir_all(dir).expect("failed to create test directory");
        }

        Self {
            _temp_dir: temp_dir,
            base,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
            xdg_runtime,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("ga-report/ga-report.db")
    }

    fn write_config(&self, content: &str) {
        let dir = self.xdg_config.join("ga-report");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(dir.join("config.toml"), content).expect("failed to write config");
    }

    fn store(&self) -> StatStore {
        let store = StatStore::open(&self.db_path()).expect("failed to open db");
        store.migrate().expect("failed to migrate db");
        store
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("ga-report"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env("XDG_RUNTIME_DIR", &env.xdg_runtime)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute ga-report: {e}"))
}

fn rendered(args: &[&str]) -> String {
    args.iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "ga-report {} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        rendered(args),
        output.status,
        stdout,
        stderr
    );
}

fn assert_failure_mentions(args: &[&str], output: &Output, needle: &str) {
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        !output.status.success(),
        "ga-report {} should have failed",
        rendered(args)
    );
    assert!(
        stderr.contains(needle),
        "expected {needle:?} in stderr of ga-report {}, got:\n{stderr}",
        rendered(args)
    );
}

fn put_url_stat(store: &StatStore, url: &str, period: &str, pageviews: i64, visits: i64) {
    store
        .upsert_url_stat(&UrlStat {
            url: url.to_string(),
            period_name: period.to_string(),
            pageviews,
            visits,
            package_id: None,
        })
        .expect("failed to seed url stat");
}

#[test]
fn init_db_creates_database() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["init-db"]);
    assert_success(&["init-db"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Schema version: 2"), "got:\n{stdout}");
    assert!(env.db_path().exists());
}

#[test]
fn load_analytics_rejects_unparseable_and_future_months() {
    let env = CliTestEnv::new();

    for month in ["2024-13", "notadate", "2999-01"] {
        let args = ["load-analytics", month];
        let output = run_bin(&env, &args);
        assert_failure_mentions(&args, &output, "invalid period");
    }
}

#[test]
fn load_analytics_without_token_is_auth_not_configured() {
    let env = CliTestEnv::new();

    let args = ["load-analytics", "latest"];
    let output = run_bin(&env, &args);
    assert_failure_mentions(&args, &output, "authentication not configured");

    env.write_config(&format!(
        "[provider]\ntoken_path = \"{}\"\nprofile_id = \"12345\"\n",
        env.base.join("missing-token.json").display()
    ));
    let output = run_bin(&env, &args);
    assert_failure_mentions(&args, &output, "run get-auth-token first");
}

#[test]
fn get_auth_token_requires_credentials_file() {
    let env = CliTestEnv::new();
    let credentials = env.base.join("absent-credentials.json");
    let credentials = credentials.to_string_lossy().into_owned();

    let args = ["get-auth-token", credentials.as_str()];
    let output = run_bin(&env, &args);
    assert_failure_mentions(&args, &output, "cannot read credentials file");
}

#[test]
fn reports_join_loaded_catalog() {
    let env = CliTestEnv::new();
    let export = env.base.join("catalog.csv");
    fs::write(
        &export,
        "name,title,id\nspend,\"Spend, over 25k\",b7c1\ncrime,Recorded crime,\n",
    )
    .expect("failed to write catalog export");

    let load_args = ["load-catalog", export.to_str().expect("utf-8 path")];
    let output = run_bin(&env, &load_args);
    assert_success(&load_args, &output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("Imported 2 dataset(s)"));

    {
        let store = env.store();
        put_url_stat(&store, "/dataset/spend", "2024-01", 10, 5);
        put_url_stat(&store, "/dataset/spend", "2024-02", 7, 3);
        put_url_stat(&store, "/dataset/crime", "2024-02", 30, 12);
        put_url_stat(&store, "/dataset/withdrawn", "2024-02", 99, 50);
        let aggregator = Aggregator::new(&store);
        for url in ["/dataset/spend", "/dataset/crime", "/dataset/withdrawn"] {
            aggregator.recompute_all(url).expect("failed to roll up");
        }
        store
            .upsert_keyed_stat("spend", "Downloads", "2024-02", 4)
            .expect("failed to seed downloads");
        store
            .upsert_referral_stat("/dataset/spend", "2024-02", 6)
            .expect("failed to seed referral");
    }

    let datasets = env.base.join("datasets.csv");
    let args = ["generate-datasets-csv", datasets.to_str().expect("utf-8 path")];
    assert_success(&args, &run_bin(&env, &args));
    assert_eq!(
        fs::read_to_string(&datasets).expect("datasets.csv missing"),
        "Title,Name,Views,Visits,Downloads,PeriodName\n\
         Recorded crime,crime,30,12,0,All\n\
         \"Spend, over 25k\",spend,17,8,4,All\n"
    );

    let referrers = env.base.join("referrers.csv");
    let args = ["generate-referrers-csv", referrers.to_str().expect("utf-8 path")];
    assert_success(&args, &run_bin(&env, &args));
    assert_eq!(
        fs::read_to_string(&referrers).expect("referrers.csv missing"),
        "Title,Name,ReferredVisits,PeriodName\n\
         \"Spend, over 25k\",spend,6,All\n\
         \"Spend, over 25k\",spend,6,2024-02\n"
    );
}

#[test]
fn fix_time_periods_fills_missing_rollups() {
    let env = CliTestEnv::new();
    {
        let store = env.store();
        put_url_stat(&store, "/dataset/spend", "2024-01", 10, 5);
        put_url_stat(&store, "/dataset/spend", "2024-02", 7, 3);
    }

    let output = run_bin(&env, &["fix-time-periods"]);
    assert_success(&["fix-time-periods"], &output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("Repaired 1 url(s)"));

    let rollup = env
        .store()
        .url_stat("/dataset/spend", ALL_PERIOD)
        .expect("failed to read rollup")
        .expect("rollup should exist");
    assert_eq!((rollup.pageviews, rollup.visits), (17, 8));

    // A second pass has nothing left to do
    let output = run_bin(&env, &["fix-time-periods"]);
    assert_success(&["fix-time-periods"], &output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("Repaired 0 url(s)"));
}
