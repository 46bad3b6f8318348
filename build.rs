// build.rs

use clap::{Arg, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn build_cli() -> Command {
    Command::new("snapd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Control-plane daemon for the snap package platform")
        .arg(
            Arg::new("socket_path")
                .long("socket-path")
                .value_name("PATH")
                .default_value("/run/snapd/snapd.sock")
                .help("Unix socket the REST API listens on"),
        )
        .arg(
            Arg::new("state_path")
                .long("state-path")
                .value_name("PATH")
                .default_value("/var/lib/snapd/state.json")
                .help("Path of the persisted state document"),
        )
        .arg(
            Arg::new("snap_mount_dir")
                .long("snap-mount-dir")
                .value_name("DIR")
                .default_value("/snap")
                .help("Directory snaps are mounted under"),
        )
}

fn main() -> std::io::Result<()> {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));

    let man = Man::new(build_cli());
    let mut buffer: Vec<u8> = Vec::new();
    man.render(&mut buffer)?;

    fs::write(out_dir.join("snapd.8"), buffer)?;

    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
