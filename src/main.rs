use argh::FromArgs;
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};

#[derive(FromArgs, PartialEq, Debug)]
/// Userspace loader for compiled kernel extensions
struct Args {
    /// print verbose parse and load diagnostics
    #[argh(switch)]
    debug: bool,

    #[argh(subcommand)]
    nested: SubCommand,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
enum SubCommand {
    Inspect(InspectArgs),
    Load(LoadArgs),
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "inspect")]
/// Parse an extension object and dump its maps, entry points and
/// relocation plan without touching the kernel.
struct InspectArgs {
    #[argh(positional)]
    /// path of the extension object to inspect
    path: String,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "load")]
/// Load an extension object and print the resulting descriptors.
struct LoadArgs {
    #[argh(positional)]
    /// path of the extension object to load
    path: String,
}

fn main() {
    let args: Args = argh::from_env();

    let level = if args.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .expect("logger already initialized");
    krill::set_debug(args.debug);

    let result = match args.nested {
        SubCommand::Inspect(args) => cmd_inspect(args),
        SubCommand::Load(args) => cmd_load(args),
    };
    if let Err(e) = result {
        eprintln!("Fatal error: {}", e);
        std::process::exit(1);
    }
}

fn cmd_inspect(args: InspectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let obj = krill::Object::open(&args.path)?.parse()?;

    println!("{}", obj.path().display());

    println!("maps ({}):", obj.maps().len());
    for map in obj.maps().iter() {
        println!(
            "  {:<16} at {}  type={} key_size={} value_size={} max_entries={} flags={}",
            map.name,
            map.offset,
            map.def.map_type,
            map.def.key_size,
            map.def.value_size,
            map.def.max_entries,
            map.def.flags,
        );
    }

    println!("entry points ({}):", obj.progs().len());
    for prog in obj.progs().entries() {
        println!(
            "  {:<16} in {:<32} {:?} at {}",
            prog.name, prog.sec_name, prog.prog_type, prog.offset
        );
    }

    let plan = obj.plan();
    println!(
        "relocations: {} skipped (maps), {} relative, {} global-data",
        plan.skipped,
        plan.relatives.len(),
        plan.globals.len()
    );
    for global in &plan.globals {
        println!("  global {} -> {:?}", global.offset, global.symbol);
    }

    Ok(())
}

fn cmd_load(args: LoadArgs) -> Result<(), Box<dyn std::error::Error>> {
    let Some(handle) = krill::load_object(&args.path) else {
        return Err(format!("could not load {}", args.path).into());
    };
    let view = krill::object_view(handle).ok_or("object vanished from the registry")?;

    println!("{} loaded, base fd {}", view.name, handle.raw());
    for map in &view.maps {
        println!("  map     {:<16} fd {}", map.name, map.fd);
    }
    for prog in &view.programs {
        println!(
            "  program {:<16} fd {}  ({:?}, {})",
            prog.name, prog.fd, prog.prog_type, prog.section
        );
    }

    Ok(())
}
