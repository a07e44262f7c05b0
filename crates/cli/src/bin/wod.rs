//! `wod` — dump the contents of a compiled WHAIS unit.

use std::path::PathBuf;

use clap::Parser;
use whais_core::endian::{load_le_u16, load_le_u32, load_le_u64};
use whais_core::types::{TypeDescriptor, TypeId, TypeWord};
use whais_vm::unit::{CompiledUnit, ProcedureEntry};
use whais_vm::Opcode;

#[derive(Debug, Parser)]
#[command(name = "wod")]
#[command(about = "Dump a compiled WHAIS unit", long_about = None, version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// The compiled unit file.
    file: PathBuf,

    /// Dump the constants area.
    #[arg(short = 'c', long)]
    constants: bool,

    /// Dump the globals table.
    #[arg(short = 'g', long)]
    globals: bool,

    /// Dump the procedures with their code disassembled.
    #[arg(short = 'p', long)]
    procedures: bool,

    /// Dump everything.
    #[arg(short = 'a', long)]
    all: bool,
}

fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let bytes = match std::fs::read(&cli.file) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("wod: cannot read '{}': {e}", cli.file.display());
            return 3;
        }
    };
    let unit = match CompiledUnit::parse(&bytes) {
        Ok(unit) => unit,
        Err(e) => {
            eprintln!("wod: {e}");
            return 1;
        }
    };

    print_header(&unit);
    if cli.constants || cli.all {
        print_constants(&unit);
    }
    if cli.globals || cli.all {
        print_globals(&unit);
    }
    if cli.procedures || cli.all {
        print_procedures(&unit);
    }
    0
}

fn print_header(unit: &CompiledUnit) {
    println!("File signature:\t\t\t'W', 'O'");
    println!("Format version:\t\t\t{}.{}", unit.format.0, unit.format.1);
    println!(
        "Language version:\t\t{}.{}",
        unit.language.0, unit.language.1
    );
    println!("Globals count:\t\t\t{}", unit.globals.len());
    println!("Procedures count:\t\t{}", unit.procedures.len());
    println!("Constants area size:\t\t{}", unit.constants().len());
}

fn print_constants(unit: &CompiledUnit) {
    println!();
    println!("************************************************************");
    println!("THE CONSTANTS AREA");
    println!("************************************************************");
    let constants = unit.constants();
    for (line, chunk) in constants.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let text: String = chunk
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        println!("{:08x}:\t{:<48}\t{}", line * 16, hex.join(" "), text);
    }
}

fn type_name(descriptor: &TypeDescriptor) -> String {
    match descriptor {
        TypeDescriptor::Table(fields) => {
            let fields: Vec<String> = fields
                .iter()
                .map(|f| {
                    let mut name = format!("{}: {}", f.name, f.kind);
                    if f.is_array {
                        name = format!("{}: ARRAY OF {}", f.name, f.kind);
                    }
                    name
                })
                .collect();
            format!("TABLE OF ({})", fields.join(", "))
        }
        TypeDescriptor::Simple(word) => simple_type_name(*word),
    }
}

fn simple_type_name(word: TypeWord) -> String {
    let base = word
        .base()
        .map(|k| k.name().to_string())
        .unwrap_or_else(|_| "?".into());
    if word.is_field() && word.is_array() {
        format!("FIELD OF ARRAY OF {base}")
    } else if word.is_field() {
        format!("FIELD OF {base}")
    } else if word.is_array() {
        format!("ARRAY OF {base}")
    } else {
        base
    }
}

fn print_globals(unit: &CompiledUnit) {
    println!();
    println!("************************************************************");
    println!("THE GLOBAL VALUES");
    println!("************************************************************");
    for (index, global) in unit.globals.iter().enumerate() {
        let kind = unit
            .type_descriptor_at(global.type_offset)
            .map(|d| type_name(&d))
            .unwrap_or_else(|_| "<corrupt type>".into());
        let external = if global.external { " EXTERN" } else { "" };
        println!("{index:4}:\t{}{external}\t{kind}", global.name);
    }
}

fn print_procedures(unit: &CompiledUnit) {
    for procedure in &unit.procedures {
        println!();
        println!("************************************************************");
        println!(
            "PROCEDURE {} ({} args, {} locals, {} syncs){}",
            procedure.name,
            procedure.args_count,
            procedure.locals_count,
            procedure.sync_count,
            if procedure.external { " EXTERN" } else { "" },
        );
        println!("************************************************************");
        for (slot, &offset) in procedure.locals_type_offsets.iter().enumerate() {
            let kind = unit
                .type_descriptor_at(offset)
                .map(|d| type_name(&d))
                .unwrap_or_else(|_| "<corrupt type>".into());
            let role = match slot {
                0 => "ret  ",
                s if s <= procedure.args_count as usize => "arg  ",
                _ => "local",
            };
            println!("  {role} {slot:3}: {kind}");
        }
        if !procedure.external {
            println!();
            disassemble(unit, procedure);
        }
    }
}

fn disassemble(unit: &CompiledUnit, procedure: &ProcedureEntry) {
    let code = unit.code_of(procedure);
    let mut pos = 0usize;
    while pos < code.len() {
        let Some(op) = Opcode::from_byte(code[pos]) else {
            println!("{pos:6}:\t.byte 0x{:02x}", code[pos]);
            pos += 1;
            continue;
        };
        let imm_len = op.immediates_len();
        if pos + 1 + imm_len > code.len() {
            println!("{pos:6}:\t{} <truncated immediates>", op.mnemonic());
            return;
        }
        let imm = &code[pos + 1..pos + 1 + imm_len];
        println!("{pos:6}:\t{}{}", op.mnemonic(), immediate_text(op, imm, unit));
        pos += 1 + imm_len;
    }
}

fn immediate_text(op: Opcode, imm: &[u8], unit: &CompiledUnit) -> String {
    use Opcode::*;
    match op {
        LdNull | LdI8 | LdLo8 | LdGb8 | Cts | BSync | ESync => format!("\t{}", imm[0]),
        LdI16 | LdLo16 | LdGb16 => format!("\t{}", load_le_u16(imm)),
        LdI32 | LdLo32 | LdGb32 => format!("\t{}", load_le_u32(imm)),
        LdI64 => format!("\t{}", load_le_u64(imm)),
        Ldc => format!("\t0x{:08x}", load_le_u32(imm)),
        Ldd => format!(
            "\t{:04}-{:02}-{:02}",
            load_le_u16(&imm[2..]) as i16,
            imm[1],
            imm[0]
        ),
        Lddt => format!(
            "\t{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            load_le_u16(&imm[5..]) as i16,
            imm[4],
            imm[3],
            imm[2],
            imm[1],
            imm[0]
        ),
        Ldht => format!(
            "\t{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            load_le_u16(&imm[9..]) as i16,
            imm[8],
            imm[7],
            imm[6],
            imm[5],
            imm[4],
            load_le_u32(imm)
        ),
        Ldrr => format!(
            "\t{}.{:018}",
            load_le_u64(imm) as i64,
            load_le_u64(&imm[8..]) as i64
        ),
        Ldt | IndTa | SelfInd => {
            let offset = load_le_u32(imm);
            match unit.const_text(offset) {
                Ok(text) => format!("\t\"{text}\""),
                Err(_) => format!("\t@{offset}"),
            }
        }
        Call => format!("\tproc {}", load_le_u32(imm)),
        Jf | Jfc | Jt | Jtc | Jmp => format!("\t{:+}", load_le_u32(imm) as i32),
        Carr => format!(
            "\t{} x {}{}",
            TypeId::from_code((imm[0] & 0x7F) as u16)
                .map(|k| k.name())
                .unwrap_or("?"),
            load_le_u16(&imm[1..]),
            if imm[0] & 0x80 != 0 { " FROM FIELD" } else { "" }
        ),
        _ => String::new(),
    }
}
