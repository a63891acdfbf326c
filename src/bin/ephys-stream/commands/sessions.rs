use crate::cli::SessionsArgs;
use crate::exit_codes;
use crate::output;
use ephys_stream::persistence::list_sessions;

pub fn execute(args: SessionsArgs) -> i32 {
    let Some(data_dir) = super::resolve_data_dir(args.data_dir.as_deref()) else {
        eprintln!("Error: No data directory; pass --data-dir or set EPHYS_DATA_DIR");
        return exit_codes::INPUT_ERROR;
    };

    let sessions = match list_sessions(&data_dir) {
        Ok(sessions) => sessions,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    };

    if args.json {
        return match output::emit_json(&sessions, false, None) {
            Ok(()) => exit_codes::SUCCESS,
            Err(e) => {
                eprintln!("Error: {}", e);
                exit_codes::EXECUTION_ERROR
            }
        };
    }

    if sessions.is_empty() {
        println!("No sessions found in {}", data_dir.display());
        return exit_codes::SUCCESS;
    }

    println!();
    println!("{:<32} {:>10}  {}", "Session", "Size", "Created");
    println!("{}", "─".repeat(70));
    for session in &sessions {
        println!(
            "  {:<30} {:>10}  {}",
            session.id,
            output::format_size(session.size_bytes),
            session
                .created_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    println!();
    println!("{} session(s) in {}", sessions.len(), data_dir.display());

    exit_codes::SUCCESS
}
