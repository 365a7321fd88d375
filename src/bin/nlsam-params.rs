use clap::Parser;
use nlsam::DenoiseParams;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
struct Args {
    /// path to the denoising parameter file to write
    parameter_file: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let params = DenoiseParams::default();
    let mut toml_string = match toml::to_string(&params) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to serialize parameters: {}", e);
            return ExitCode::FAILURE;
        }
    };
    toml_string.push('\n');
    let filename = args.parameter_file.with_extension("toml");
    let written = File::create(&filename).and_then(|mut f| f.write_all(toml_string.as_bytes()));
    if let Err(e) = written {
        eprintln!("failed to write {}: {}", filename.display(), e);
        return ExitCode::FAILURE;
    }
    println!("wrote default parameter file to {}", filename.display());
    ExitCode::SUCCESS
}
