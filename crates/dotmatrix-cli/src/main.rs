mod config;
mod persist;

use std::{
    error::Error,
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::{Parser, ValueEnum};
use dotmatrix_core::{
    Config, GameBoy, HardwareMode,
    interfaces::SerialLink,
    ppu::{SCREEN_HEIGHT, SCREEN_WIDTH},
};
use log::{error, info, warn};

use crate::{config::CliConfig, persist::FileSaveStore};

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Dmg,
    Cgb,
}

#[derive(Parser)]
#[command(version, about = "Run a Game Boy ROM without a window")]
struct Args {
    /// Path to ROM file
    rom: PathBuf,

    /// Number of frames to run
    #[arg(long, conflicts_with = "cycles")]
    frames: Option<u64>,

    /// Number of CPU machine cycles to run
    #[arg(long)]
    cycles: Option<u64>,

    /// Force the hardware model instead of following the cartridge header
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Write the last frame to this PNG file
    #[arg(long)]
    dump_png: Option<PathBuf>,

    /// Directory for battery-backed RAM and clock saves
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Write a snapshot here when the run ends
    #[arg(long)]
    snapshot_out: Option<PathBuf>,

    /// Restore this snapshot before running
    #[arg(long)]
    snapshot_in: Option<PathBuf>,

    /// Print every byte sent over the link cable to stdout
    #[arg(long)]
    serial_stdout: bool,

    /// Log filter, e.g. `debug` or `dotmatrix_core=trace`
    #[arg(long)]
    log_level: Option<String>,

    /// Config file to read instead of the default location
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Serial output copied to a byte stream; test ROMs report results this way.
struct WriterLink<W>(W);

impl<W: Write + Send> SerialLink for WriterLink<W> {
    fn send_data(&mut self, byte: u8) {
        if let Err(e) = self.0.write_all(&[byte]).and_then(|()| self.0.flush()) {
            warn!("failed to write serial byte {byte:02X}: {e}");
        }
    }
}

fn init_logging(level: Option<&str>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = level {
        builder.parse_filters(level);
    }
    builder.init();
}

fn write_png(path: &Path, frame: &[u32]) -> Result<(), Box<dyn Error>> {
    let file = BufWriter::new(File::create(path)?);
    let mut encoder = png::Encoder::new(file, SCREEN_WIDTH as u32, SCREEN_HEIGHT as u32);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header()?;

    let mut data = Vec::with_capacity(frame.len() * 3);
    for &px in frame {
        data.extend_from_slice(&[(px >> 16) as u8, (px >> 8) as u8, px as u8]);
    }
    writer.write_image_data(&data)?;
    writer.finish()?;
    Ok(())
}

fn run(args: Args, cfg: CliConfig) -> Result<(), Box<dyn Error>> {
    let mode = match args.mode {
        Some(ModeArg::Dmg) => HardwareMode::Dmg,
        Some(ModeArg::Cgb) => HardwareMode::Cgb,
        None => cfg.mode,
    };
    let rom = std::fs::read(&args.rom)
        .map_err(|e| format!("failed to read {}: {e}", args.rom.display()))?;
    let mut gb = GameBoy::from_rom(
        Config {
            mode,
            sample_rate: cfg.sample_rate,
        },
        rom,
    )?;

    let save_dir = match args.save_dir.or(cfg.save_dir) {
        Some(dir) => dir,
        None => args
            .rom
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default(),
    };
    gb.set_save_store(Box::new(FileSaveStore::new(save_dir)))?;

    if args.serial_stdout || cfg.serial_stdout {
        gb.set_serial_link(Box::new(WriterLink(std::io::stdout())));
    }

    if let Some(path) = &args.snapshot_in {
        let bytes = std::fs::read(path)?;
        gb.restore(&bytes)?;
        info!("restored snapshot {}", path.display());
    }

    if let Some(cycles) = args.cycles {
        let mut ran = 0u64;
        while ran < cycles {
            ran += u64::from(gb.step());
        }
        info!("ran {ran} machine cycles");
    } else {
        let frames = args.frames.unwrap_or(cfg.frames);
        let mut completed = 0u64;
        for _ in 0..frames {
            if gb.run_frame() {
                completed += 1;
            }
        }
        info!("ran {frames} frames ({completed} displayed)");
    }

    gb.flush_save()?;

    if let Some(path) = &args.dump_png {
        write_png(path, gb.frame())?;
        info!("wrote frame to {}", path.display());
    }

    if let Some(path) = &args.snapshot_out {
        std::fs::write(path, gb.snapshot()?)?;
        info!("wrote snapshot {}", path.display());
    }

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    let cfg_path = args.config.clone().unwrap_or_else(config::default_config_path);
    let cfg = config::load_from_file(&cfg_path);

    match run(args, cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn png_dump_keeps_frame_colours() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let mut frame = vec![0x00E0_F8D0u32; SCREEN_WIDTH * SCREEN_HEIGHT];
        frame[1] = 0x0008_1820;
        write_png(&path, &frame).unwrap();

        let decoder = png::Decoder::new(std::io::BufReader::new(File::open(&path).unwrap()));
        let mut reader = decoder.read_info().unwrap();
        let mut buf = vec![0; reader.output_buffer_size().unwrap()];
        let info = reader.next_frame(&mut buf).unwrap();
        assert_eq!((info.width, info.height), (160, 144));
        assert_eq!(&buf[..6], &[0xE0, 0xF8, 0xD0, 0x08, 0x18, 0x20]);
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn serial_bytes_reach_the_writer() {
        let mut link = WriterLink(Vec::new());
        link.send_data(b'o');
        link.send_data(b'k');
        assert_eq!(link.0, b"ok");

        // A closed stream is reported, not fatal.
        let mut broken = WriterLink(Broken);
        broken.send_data(b'x');
        assert_eq!(broken.receive_data(), 0xFF);
    }

    #[test]
    fn flags_parse() {
        let args = Args::try_parse_from([
            "dotmatrix",
            "game.gb",
            "--frames",
            "10",
            "--mode",
            "cgb",
            "--serial-stdout",
        ])
        .unwrap();
        assert_eq!(args.frames, Some(10));
        assert!(matches!(args.mode, Some(ModeArg::Cgb)));
        assert!(args.serial_stdout);

        assert!(
            Args::try_parse_from(["dotmatrix", "game.gb", "--frames", "1", "--cycles", "1"])
                .is_err()
        );
    }
}
