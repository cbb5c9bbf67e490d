// The intuition binary: CLI parsing, single-instance forwarding, host
// sinks and the frame/key pump around the Machine.

use clap::{Arg, ArgAction, Command};
use intuition_engine::audio::AudioSink;
use intuition_engine::host::{
    DisplaySink, HeadlessAudio, HeadlessDisplay, HostEvent, MinifbDisplay, RodioAudio,
};
use intuition_engine::lifecycle::AudioSinkFactory;
use intuition_engine::{
    ipc, BootRequest, ChipKind, CpuKind, EngineError, Machine, VERSION,
};
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn cli() -> Command {
    let mode_flag = |name: &'static str, help: &'static str| {
        Arg::new(name).long(name).action(ArgAction::SetTrue).help(help)
    };
    Command::new("intuition")
        .version(VERSION)
        .about("The Intuition Engine retro-computing virtual machine")
        .arg(mode_flag("ie32", "IE32 RISC machine"))
        .arg(mode_flag("ie64", "IE64 RISC machine with FP32 FPU"))
        .arg(mode_flag("m68k", "Motorola 68020 machine"))
        .arg(mode_flag("z80", "Zilog Z80 machine"))
        .arg(mode_flag("m6502", "MOS 6502 machine"))
        .arg(mode_flag("x86", "Intel x86-32 machine"))
        .arg(mode_flag("basic", "boot straight into BASIC"))
        .arg(
            Arg::new("basic-image")
                .long("basic-image")
                .value_name("PATH")
                .help("BASIC ROM image to boot"),
        )
        .arg(mode_flag("term", "terminal mode: no window, guest I/O on stdio"))
        .arg(mode_flag("psg", "AY/YM PSG playback"))
        .arg(mode_flag("psg-plus", "PSG with enhanced rendering"))
        .arg(mode_flag("sid", "SID playback (6581, PAL)"))
        .arg(mode_flag("sid-plus", "SID with enhanced rendering"))
        .arg(mode_flag("sid-pal", "force the PAL SID clock"))
        .arg(mode_flag("sid-ntsc", "force the NTSC SID clock"))
        .arg(mode_flag("sid-8580", "model the 8580 (no ADSR delay bug)"))
        .arg(mode_flag("pokey", "POKEY playback"))
        .arg(mode_flag("pokey-plus", "POKEY with enhanced rendering"))
        .arg(mode_flag("ted", "TED playback"))
        .arg(mode_flag("ted-plus", "TED with enhanced rendering"))
        .arg(mode_flag("ahx", "AHX playback"))
        .arg(mode_flag("ahx-plus", "AHX with enhanced rendering"))
        .arg(Arg::new("load-addr").long("load-addr").value_name("ADDR").help(
            "program load address (hex with 0x prefix, or decimal)",
        ))
        .arg(Arg::new("entry").long("entry").value_name("ADDR").help("program entry point"))
        .arg(Arg::new("width").long("width").value_name("PIXELS"))
        .arg(Arg::new("height").long("height").value_name("PIXELS"))
        .arg(
            Arg::new("scale")
                .long("scale")
                .value_name("1..4")
                .default_value("1")
                .help("integer window scale"),
        )
        .arg(mode_flag("fullscreen", "borderless full-window display"))
        .arg(mode_flag("perf", "measure executed instructions and wall time"))
        .arg(mode_flag("features", "list platform features and exit"))
        .arg(mode_flag("headless", "no window and no audio device (CI)"))
        .arg(Arg::new("file").value_name("FILE").help("program or media file"))
}

fn parse_addr(text: &str) -> Result<u32, EngineError> {
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        text.parse()
    };
    parsed.map_err(|_| EngineError::config(format!("invalid address {text:?}")))
}

struct Options {
    request: BootRequest,
    term: bool,
    headless: bool,
    scale: u32,
    fullscreen: bool,
    sid_ntsc: bool,
    sid_8580: bool,
    width: Option<usize>,
    height: Option<usize>,
    open_path: Option<PathBuf>,
}

fn parse_options() -> Result<Option<Options>, EngineError> {
    let matches = cli().get_matches();

    if matches.get_flag("features") {
        println!("Intuition Engine {VERSION}");
        for feature in intuition_engine::feature_list() {
            println!("  {feature}");
        }
        return Ok(None);
    }

    let cpu_flags: Vec<(&str, CpuKind)> = vec![
        ("ie32", CpuKind::Ie32),
        ("ie64", CpuKind::Ie64),
        ("m68k", CpuKind::M68k),
        ("z80", CpuKind::Z80),
        ("m6502", CpuKind::Mos6502),
        ("x86", CpuKind::X86),
    ];
    let selected_cpus: Vec<CpuKind> = cpu_flags
        .iter()
        .filter(|(flag, _)| matches.get_flag(flag))
        .map(|(_, kind)| *kind)
        .collect();
    if selected_cpus.len() > 1 {
        return Err(EngineError::config("pick at most one CPU mode flag"));
    }

    let chip_flags: Vec<(&str, ChipKind, bool)> = vec![
        ("psg", ChipKind::Psg, false),
        ("psg-plus", ChipKind::Psg, true),
        ("sid", ChipKind::Sid, false),
        ("sid-plus", ChipKind::Sid, true),
        ("pokey", ChipKind::Pokey, false),
        ("pokey-plus", ChipKind::Pokey, true),
        ("ted", ChipKind::Ted, false),
        ("ted-plus", ChipKind::Ted, true),
        ("ahx", ChipKind::Ahx, false),
        ("ahx-plus", ChipKind::Ahx, true),
    ];
    let selected_chips: Vec<(ChipKind, bool)> = chip_flags
        .iter()
        .filter(|(flag, _, _)| matches.get_flag(flag))
        .map(|(_, kind, plus)| (*kind, *plus))
        .collect();
    if selected_chips.len() > 1 {
        return Err(EngineError::config("pick at most one sound chip flag"));
    }

    let file = matches.get_one::<String>("file").map(PathBuf::from);

    let mut request = BootRequest::default();
    let mut cpu = selected_cpus.first().copied();
    let mut chip = selected_chips.first().copied();

    // A bare file argument picks its machine by extension.
    if let Some(path) = &file {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if cpu.is_none() && chip.is_none() {
            if let Some(kind) = CpuKind::from_extension(ext) {
                cpu = Some(kind);
            } else if let Some(kind) = ChipKind::from_extension(ext) {
                chip = Some((kind, false));
            } else {
                return Err(EngineError::config(format!(
                    "cannot infer a machine mode from {path:?}; pass a mode flag"
                )));
            }
        }
    }

    request.cpu = cpu.unwrap_or(CpuKind::Ie64);
    request.chip = chip.map(|(kind, _)| kind);
    request.chip_plus = chip.map(|(_, plus)| plus).unwrap_or(false);
    request.program = file.clone();
    request.perf = matches.get_flag("perf");
    request.basic_image = matches.get_one::<String>("basic-image").map(PathBuf::from);
    // No program and no explicit machine: power-on boots BASIC on IE64.
    request.boot_to_basic =
        matches.get_flag("basic") || (file.is_none() && cpu.is_none() && chip.is_none());
    if let Some(addr) = matches.get_one::<String>("load-addr") {
        request.load_addr = Some(parse_addr(addr)?);
    }
    if let Some(addr) = matches.get_one::<String>("entry") {
        request.entry = Some(parse_addr(addr)?);
    }

    let scale: u32 = matches
        .get_one::<String>("scale")
        .and_then(|s| s.parse().ok())
        .filter(|s| (1..=4).contains(s))
        .ok_or_else(|| EngineError::config("--scale takes 1..4"))?;

    let parse_dim = |name: &str| -> Option<usize> {
        matches.get_one::<String>(name).and_then(|s| s.parse().ok())
    };

    Ok(Some(Options {
        request,
        term: matches.get_flag("term"),
        headless: matches.get_flag("headless"),
        scale,
        fullscreen: matches.get_flag("fullscreen"),
        sid_ntsc: matches.get_flag("sid-ntsc") && !matches.get_flag("sid-pal"),
        sid_8580: matches.get_flag("sid-8580"),
        width: parse_dim("width"),
        height: parse_dim("height"),
        open_path: file,
    }))
}

fn audio_factory(headless: bool) -> AudioSinkFactory {
    Box::new(move || -> Box<dyn AudioSink> {
        if headless {
            return Box::new(HeadlessAudio);
        }
        match RodioAudio::new() {
            Ok(sink) => Box::new(sink),
            Err(e) => {
                // Fall back to a silent machine rather than dying.
                log::warn!("audio: {e}; continuing without sound");
                Box::new(HeadlessAudio)
            }
        }
    })
}

fn run() -> Result<(), EngineError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Some(options) = parse_options()? else { return Ok(()) };

    let machine = Machine::new(
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        audio_factory(options.headless || options.term),
    );

    // Single instance: hand the file to a running primary if one exists.
    match ipc::claim_or_forward(options.open_path.as_deref(), machine.open_request_sender())? {
        ipc::Instance::Forwarded => return Ok(()),
        ipc::Instance::Primary => {}
    }

    machine.set_sid_ntsc(options.sid_ntsc);
    if options.sid_8580 {
        machine.set_sid_model(intuition_engine::chips::sid::SidModel::Mos8580);
    }

    let perf = options.request.perf;
    machine.run_program_with_full_reset(options.request.clone())?;

    // Requested window geometry picks the smallest framebuffer mode
    // that covers it.
    if let (Some(width), Some(height)) = (options.width, options.height) {
        let mode = match (width, height) {
            (w, h) if w <= 640 && h <= 480 => 0u32,
            (w, h) if w <= 800 && h <= 600 => 1,
            _ => 2,
        };
        machine.bus.write32(intuition_engine::mmio::FB_MODE, mode);
    }

    if options.term {
        // Pump stdin into the guest terminal.
        let terminal = machine.terminal.clone();
        std::thread::Builder::new()
            .name("stdin-pump".into())
            .spawn(move || {
                for byte in std::io::stdin().bytes().map_while(Result::ok) {
                    terminal.push_input(byte);
                }
            })
            .map_err(|e| EngineError::DeviceInit(format!("stdin pump: {e}")))?;
    }

    let mut display: Box<dyn DisplaySink> = if options.headless || options.term {
        Box::new(HeadlessDisplay)
    } else {
        Box::new(MinifbDisplay::new("Intuition Engine", options.scale, options.fullscreen))
    };

    let windowed = !(options.headless || options.term);
    let mut status_bar = false;
    let mut frames: u64 = 0;
    let mut last_frame: Option<(usize, usize, Vec<u32>)> = None;

    loop {
        if let Some(frame) = machine.compositor.front().take() {
            last_frame = Some(frame);
        }
        if let Some((width, height, pixels)) = &last_frame {
            if !display.present(*width, *height, pixels) {
                break;
            }
            frames += 1;
            if status_bar && frames % 60 == 0 {
                if let Some(control) = machine.cpu_control() {
                    log::info!(
                        "status: {} instructions, frame {}",
                        control.instructions.load(Ordering::Acquire),
                        frames
                    );
                }
            }
        } else {
            std::thread::sleep(Duration::from_millis(2));
        }

        let mut quit = false;
        for event in display.poll_events() {
            match event {
                HostEvent::Quit => quit = true,
                HostEvent::ToggleMonitor => machine.toggle_debugger(),
                HostEvent::HardReset => {
                    if let Err(e) = machine.hard_reset_to_basic() {
                        log::error!("hard reset failed: {e}");
                    }
                }
                HostEvent::ToggleStatusBar => status_bar = !status_bar,
                HostEvent::Char(byte) => machine.terminal.push_input(byte),
            }
        }
        if quit {
            break;
        }

        if let Some(path) = machine.pending_open_request() {
            if let Err(e) = machine.open_path(path) {
                log::error!("open request failed: {e}");
            }
        }

        // Without a window the process lives exactly as long as the
        // guest program.
        if !windowed {
            if let Some(control) = machine.cpu_control() {
                if control.finished.load(Ordering::Acquire) {
                    break;
                }
            }
        }
    }

    let control_for_perf = machine.cpu_control();
    machine.shutdown();

    if perf {
        if let Some(control) = control_for_perf {
            let instructions = control.instructions.load(Ordering::Acquire);
            let elapsed = control.perf_elapsed();
            let mips = instructions as f64 / elapsed.as_secs_f64().max(1e-9) / 1e6;
            println!(
                "perf: {instructions} instructions in {:.3} s ({mips:.1} MIPS)",
                elapsed.as_secs_f64()
            );
        }
    }
    Ok(())
}

fn main() {
    match run() {
        Ok(()) => {}
        Err(e) => {
            eprintln!("intuition: {e}");
            std::process::exit(e.exit_code());
        }
    }
}
