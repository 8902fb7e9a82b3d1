use std::fmt::Write;
use std::path::PathBuf;
use std::{env, fs};

struct ConfigItem {
    name: &'static str,
    default: usize,
}

static CONFIGS: &[ConfigItem] = &[
    ConfigItem {
        name: "MAX_BONDINGS",
        default: 16,
    },
    ConfigItem {
        name: "MAX_CONNECTIONS",
        default: 4,
    },
    ConfigItem {
        name: "HRM_MAX_DEVICES",
        default: 8,
    },
    ConfigItem {
        name: "CONN_PARAMS_MAX_CONSUMERS",
        default: 4,
    },
    ConfigItem {
        name: "HRM_REMINDER_INTERVAL_SECS",
        default: 45 * 60,
    },
];

fn main() {
    let mut data = String::new();
    for item in CONFIGS {
        let var = format!("BONDKEEP_{}", item.name);
        println!("cargo:rerun-if-env-changed={}", var);
        let value = match env::var(&var) {
            Ok(value) => match value.parse::<usize>() {
                Ok(value) => value,
                Err(_) => panic!("{} must be an unsigned integer, got {:?}", var, value),
            },
            Err(_) => item.default,
        };
        writeln!(&mut data, "pub const {}: usize = {};", item.name, value).unwrap();
    }

    if let Ok(value) = env::var("BONDKEEP_MAX_BONDINGS") {
        if value.parse::<usize>().map(|v| v == 0 || v > 254).unwrap_or(true) {
            panic!("BONDKEEP_MAX_BONDINGS must be between 1 and 254");
        }
    }

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").unwrap());
    fs::write(out_dir.join("config.rs"), data).unwrap();
    println!("cargo:rerun-if-changed=build.rs");
}
