//! Output formatting for rules and monitor records.

use clap::ValueEnum;
use fsgate_core::record::{set_info, MonitorRecord, OpMajor};
use fsgate_core::rule::Rule;
use fsgate_core::version::CoreVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    List,
    Csv,
    Json,
}

pub fn format_version(v: CoreVersion) -> String {
    format!("{}.{}.{}.{}", v.major, v.minor, v.patch, v.build)
}

pub fn print_rules(rules: &[Rule], format: OutputFormat) {
    match format {
        OutputFormat::List => {
            for r in rules {
                println!("major: {:13} minor: {:9} expr: {}", r.major, r.minor, r.pattern);
            }
            println!("{} rule(s)", rules.len());
        }
        OutputFormat::Csv => {
            println!("major,minor,expr");
            for r in rules {
                println!("{},{},{}", r.major, r.minor, csv_escape(&r.pattern));
            }
        }
        OutputFormat::Json => match serde_json::to_string_pretty(rules) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("error: cannot serialize rules: {e}"),
        },
    }
}

pub fn print_record_header(format: OutputFormat) {
    if format == OutputFormat::Csv {
        println!("time,operation,pid,tid,status,rule,path,rename");
    }
}

pub fn print_record(record: &MonitorRecord, format: OutputFormat) {
    match format {
        OutputFormat::List => {
            println!(
                "[{}] {} pid={} tid={} status={} rule={} path={}{}",
                record.record_time,
                operation_name(record),
                record.pid,
                record.tid,
                record.op_status,
                record.rule_pattern,
                record.file_path,
                record
                    .rename_path
                    .as_deref()
                    .map(|p| format!(" rename={p}"))
                    .unwrap_or_default(),
            );
        }
        OutputFormat::Csv => {
            println!(
                "{},{},{},{},{},{},{},{}",
                record.record_time,
                operation_name(record),
                record.pid,
                record.tid,
                record.op_status,
                csv_escape(&record.rule_pattern),
                csv_escape(&record.file_path),
                record.rename_path.as_deref().map(csv_escape).unwrap_or_default(),
            );
        }
        OutputFormat::Json => match serde_json::to_string(record) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("error: cannot serialize record: {e}"),
        },
    }
}

fn operation_name(record: &MonitorRecord) -> &'static str {
    match (record.major_fn, record.minor_fn) {
        (OpMajor::Create, _) => "create",
        (OpMajor::Write, _) => "write",
        (OpMajor::SetInformation, set_info::RENAME) => "rename",
        (OpMajor::SetInformation, set_info::DISPOSITION) => "delete",
        (OpMajor::SetInformation, _) => "set-information",
        (OpMajor::Cleanup, _) => "close",
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
