//! Build script for corio-runtime
//!
//! Handles configuration merging:
//! 1. Start with library defaults
//! 2. If COR_CONFIG_RS env var is set, parse user's config file
//! 3. Merge user values over defaults (user wins)
//! 4. Generate OUT_DIR/cor_merged_config.rs

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

struct ConfigParam {
    name: &'static str,
    rust_type: &'static str,
    default_value: &'static str,
}

const CONFIG_PARAMS: &[ConfigParam] = &[
    ConfigParam {
        name: "STACK_SIZE",
        rust_type: "usize",
        default_value: "128 * 1024",
    },
    ConfigParam {
        name: "POOL_SIZE",
        rust_type: "usize",
        default_value: "1000",
    },
    ConfigParam {
        name: "CONNECT_TIMEOUT_MS",
        rust_type: "u64",
        default_value: "75_000",
    },
    ConfigParam {
        name: "IO_THREADS",
        rust_type: "usize",
        default_value: "4",
    },
    ConfigParam {
        name: "WHEEL_BUCKETS",
        rust_type: "usize",
        default_value: "6",
    },
    ConfigParam {
        name: "WHEEL_INTERVAL_S",
        rust_type: "u64",
        default_value: "10",
    },
    ConfigParam {
        name: "EPOLL_TIMEOUT_MS",
        rust_type: "i32",
        default_value: "10_000",
    },
    ConfigParam {
        name: "HOOK_ENABLED",
        rust_type: "bool",
        default_value: "true",
    },
    ConfigParam {
        name: "LOG_LEVEL",
        rust_type: "&str",
        default_value: "\"info\"",
    },
];

fn main() {
    let out_dir = match env::var("OUT_DIR") {
        Ok(dir) => dir,
        Err(_) => panic!("OUT_DIR not set"),
    };
    let dest_path = Path::new(&out_dir).join("cor_merged_config.rs");

    let mut config: HashMap<&str, String> = CONFIG_PARAMS
        .iter()
        .map(|p| (p.name, p.default_value.to_string()))
        .collect();

    if let Ok(user_path) = env::var("COR_CONFIG_RS") {
        println!("cargo:rerun-if-changed={}", user_path);
        match fs::read_to_string(&user_path) {
            Ok(content) => {
                parse_and_merge(&content, &mut config);
                println!("cargo:warning=Using custom config: {}", user_path);
            }
            Err(e) => {
                println!("cargo:warning=Failed to read COR_CONFIG_RS ({}): {}", user_path, e);
            }
        }
    }
    println!("cargo:rerun-if-env-changed=COR_CONFIG_RS");

    let output = generate_config(&config);
    if let Err(e) = fs::write(&dest_path, output) {
        panic!("failed to write merged config: {}", e);
    }
}

/// Merge `pub const NAME: TYPE = VALUE;` lines over the defaults
fn parse_and_merge(content: &str, config: &mut HashMap<&str, String>) {
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        let Some((name, value)) = parse_const_line(line) else {
            continue;
        };
        match CONFIG_PARAMS.iter().find(|p| p.name == name) {
            Some(param) => {
                config.insert(param.name, value);
            }
            None => println!("cargo:warning=Unknown config parameter: {}", name),
        }
    }
}

fn parse_const_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("pub const ")?.trim();
    let colon = rest.find(':')?;
    let eq = rest.find('=')?;
    let semi = rest.rfind(';').unwrap_or(rest.len());
    let name = rest[..colon].trim().to_string();
    let value = rest[eq + 1..semi].trim().to_string();
    Some((name, value))
}

fn generate_config(config: &HashMap<&str, String>) -> String {
    let mut output = String::from("// Auto-generated by build.rs - do not edit\n\n");
    for param in CONFIG_PARAMS {
        let value = config
            .get(param.name)
            .map(String::as_str)
            .unwrap_or(param.default_value);
        let ty = if param.rust_type == "&str" { "&'static str" } else { param.rust_type };
        output.push_str(&format!("pub const {}: {} = {};\n", param.name, ty, value));
    }
    output
}
