//! Compile-time defaults, merged by `build.rs` from the library values and
//! an optional `COR_CONFIG_RS` override file.

include!(concat!(env!("OUT_DIR"), "/cor_merged_config.rs"));
