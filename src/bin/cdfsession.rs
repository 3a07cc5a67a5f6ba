use cdfsession::{OpenFlags, Session, SessionConfig};
use std::path::PathBuf;

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    match args[1].as_str() {
        "inspect" => cmd_inspect(&args[2..]),
        "limits" => cmd_limits(&args[2..]),
        "config" => cmd_config(),
        other => {
            print_usage();
            Err(format!("unknown top-level command: {other}"))
        }
    }
}

fn cmd_inspect(args: &[String]) -> Result<(), String> {
    let path = PathBuf::from(parse_flag_value(args, "--path").ok_or("--path is required")?);
    let mut session = Session::default();
    let id = session
        .open(&path, OpenFlags::empty())
        .map_err(|e| format!("open {}: {e}", path.display()))?;
    let info = session.describe(id).map_err(|e| e.to_string());
    let closed = session.close(id).map_err(|e| e.to_string());
    let info = info?;
    closed?;
    let json = serde_json::to_string_pretty(&info).map_err(|e| format!("encode: {e}"))?;
    println!("{json}");
    Ok(())
}

fn cmd_limits(args: &[String]) -> Result<(), String> {
    let request = match parse_flag_value(args, "--request") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|e| format!("invalid --request: {e}"))?,
        None => 0,
    };
    let mut session = Session::default();
    let capacity = session.max_open_files(request).map_err(|e| e.to_string())?;
    println!("system_limit\t{}", session.system_limit());
    println!("negotiated\t{capacity}");
    println!("open\t{}", session.current_open_count());
    Ok(())
}

fn cmd_config() -> Result<(), String> {
    let json = serde_json::to_string_pretty(&SessionConfig::default())
        .map_err(|e| format!("encode: {e}"))?;
    println!("{json}");
    Ok(())
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    for idx in 0..args.len() {
        if args[idx] == flag {
            return args.get(idx + 1).cloned();
        }
    }
    None
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  cdfsession inspect --path <file>");
    eprintln!("  cdfsession limits [--request <n>]");
    eprintln!("  cdfsession config");
}
