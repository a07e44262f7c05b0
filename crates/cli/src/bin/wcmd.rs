//! `wcmd` — the offline database shell.
//!
//! Reads one command per line; the registered command table mirrors the
//! server-side administration surface. An unknown command prints a
//! diagnostic and the process exits non-zero at the end.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;

use clap::Parser;
use whais_core::types::{FieldSpec, TypeId};
use whais_dbs::{DbsHandle, StorageConfig};

#[derive(Debug, Parser)]
#[command(name = "wcmd")]
#[command(about = "WHAIS database shell", long_about = None, version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Database directory to open.
    #[arg(short, long)]
    database: PathBuf,

    /// Database name (defaults to the directory name).
    #[arg(short, long)]
    name: Option<String>,
}

struct CmdEntry {
    name: &'static str,
    description: &'static str,
    extended_help: &'static str,
    exec: fn(&mut ShellContext, &[&str]) -> Result<(), String>,
}

struct ShellContext {
    dbs: DbsHandle,
    finished: bool,
}

fn command_table() -> BTreeMap<&'static str, CmdEntry> {
    let mut commands = BTreeMap::new();
    for entry in [
        CmdEntry {
            name: "help",
            description: "Display help on available commands.",
            extended_help: "Show the list of commands or an extended help about a command.\n\
                            Usage:\n  help [command]\nExample:\n  help table",
            exec: cmd_help,
        },
        CmdEntry {
            name: "echo",
            description: "Echo its arguments to the console.",
            extended_help: "Print the rest of the line.\nUsage:\n  echo [user text] ...",
            exec: cmd_echo,
        },
        CmdEntry {
            name: "list",
            description: "List the persistent tables.",
            extended_help: "List the names of every table in the catalog.\nUsage:\n  list",
            exec: cmd_list,
        },
        CmdEntry {
            name: "table",
            description: "Describe one table.",
            extended_help: "Print a table's fields, row count and indexes.\n\
                            Usage:\n  table <name>",
            exec: cmd_table,
        },
        CmdEntry {
            name: "add",
            description: "Create a table.",
            extended_help: "Create a table from field specifications.\n\
                            Usage:\n  add <name> <field>:<TYPE>[]...\nExample:\n  \
                            add events stamp:DATETIME count:UINT32 tags:INT8[]",
            exec: cmd_add,
        },
        CmdEntry {
            name: "drop",
            description: "Delete a table.",
            extended_help: "Remove a table and its files.\nUsage:\n  drop <name>",
            exec: cmd_drop,
        },
        CmdEntry {
            name: "quit",
            description: "Leave the shell.",
            extended_help: "Flush every table and exit.\nUsage:\n  quit",
            exec: cmd_quit,
        },
    ] {
        commands.insert(entry.name, entry);
    }
    commands
}

fn cmd_help(_ctx: &mut ShellContext, args: &[&str]) -> Result<(), String> {
    let commands = command_table();
    match args.first() {
        None => {
            for entry in commands.values() {
                println!("{:10} {}", entry.name, entry.description);
            }
            Ok(())
        }
        Some(name) => match commands.get(name) {
            Some(entry) => {
                println!("Command '{}' help:\n\n{}", entry.name, entry.extended_help);
                Ok(())
            }
            None => Err(format!("unknown command '{name}'")),
        },
    }
}

fn cmd_echo(_ctx: &mut ShellContext, args: &[&str]) -> Result<(), String> {
    println!("{}", args.join(" "));
    Ok(())
}

fn cmd_list(ctx: &mut ShellContext, _args: &[&str]) -> Result<(), String> {
    let names = ctx.dbs.table_names().map_err(|e| e.to_string())?;
    for name in names {
        println!("{name}");
    }
    Ok(())
}

fn cmd_table(ctx: &mut ShellContext, args: &[&str]) -> Result<(), String> {
    let name = args.first().ok_or("usage: table <name>")?;
    let table = ctx.dbs.retrieve_table(name).map_err(|e| e.to_string())?;
    println!("Table '{name}', {} rows.", table.allocated_rows());
    for (index, field) in table.schema().fields().iter().enumerate() {
        let indexed = if table.has_field_index(index as u16) {
            " (indexed)"
        } else {
            ""
        };
        let array = if field.is_array { "ARRAY OF " } else { "" };
        println!("  {index:3}: {} {array}{}{indexed}", field.name, field.kind);
    }
    Ok(())
}

fn parse_field(raw: &str) -> Result<FieldSpec, String> {
    let (name, kind) = raw
        .split_once(':')
        .ok_or_else(|| format!("field '{raw}' is not <name>:<TYPE>"))?;
    let (kind, is_array) = match kind.strip_suffix("[]") {
        Some(kind) => (kind, true),
        None => (kind, false),
    };
    let kind: TypeId = kind
        .parse()
        .map_err(|_| format!("unknown type '{kind}'"))?;
    Ok(FieldSpec::new(name, kind, is_array))
}

fn cmd_add(ctx: &mut ShellContext, args: &[&str]) -> Result<(), String> {
    let (name, fields) = args
        .split_first()
        .ok_or("usage: add <name> <field>:<TYPE> ...")?;
    let fields: Vec<FieldSpec> = fields
        .iter()
        .map(|raw| parse_field(raw))
        .collect::<Result<_, _>>()?;
    ctx.dbs.add_table(name, fields).map_err(|e| e.to_string())?;
    println!("Table '{name}' created.");
    Ok(())
}

fn cmd_drop(ctx: &mut ShellContext, args: &[&str]) -> Result<(), String> {
    let name = args.first().ok_or("usage: drop <name>")?;
    ctx.dbs.delete_table(name).map_err(|e| e.to_string())?;
    println!("Table '{name}' deleted.");
    Ok(())
}

fn cmd_quit(ctx: &mut ShellContext, _args: &[&str]) -> Result<(), String> {
    ctx.dbs.sync().map_err(|e| e.to_string())?;
    ctx.finished = true;
    Ok(())
}

fn main() {
    std::process::exit(run(Cli::parse()));
}

fn run(cli: Cli) -> i32 {
    let name = cli.name.unwrap_or_else(|| {
        cli.database
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "default".into())
    });
    let dbs = match DbsHandle::open(
        &name,
        &cli.database,
        &cli.database.join("tmp"),
        StorageConfig::default(),
    ) {
        Ok(dbs) => dbs,
        Err(e) => {
            eprintln!("wcmd: cannot open '{}': {e}", cli.database.display());
            return 3;
        }
    };

    let commands = command_table();
    let mut ctx = ShellContext {
        dbs,
        finished: false,
    };
    let stdin = std::io::stdin();
    let mut failed = false;

    print!("> ");
    let _ = std::io::stdout().flush();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            print!("> ");
            let _ = std::io::stdout().flush();
            continue;
        };
        let args: Vec<&str> = parts.collect();
        match commands.get(command) {
            None => {
                eprintln!("Unknown command '{command}'. Try 'help'.");
                failed = true;
            }
            Some(entry) => {
                if let Err(message) = (entry.exec)(&mut ctx, &args) {
                    eprintln!("{command}: {message}");
                    failed = true;
                }
            }
        }
        if ctx.finished {
            break;
        }
        print!("> ");
        let _ = std::io::stdout().flush();
    }

    if failed { 1 } else { 0 }
}
