use clap::{arg, command, ArgAction};
use log::{info, LevelFilter};
use simplelog::{Config, SimpleLogger};

use memflow_linux_inspect::layout::{LayoutSource, PrintkLayout};
use memflow_linux_inspect::{NoSymbols, VmCoreInfo, KERNEL_MODULE};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = command!()
        .arg(arg!(<VMCOREINFO> "file holding the VMCOREINFO note text"))
        .arg(arg!(-v --verbose ... "more logging").action(ArgAction::Count))
        .get_matches();

    let level = match matches.get_count("verbose") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    SimpleLogger::init(level, Config::default())?;

    let path = matches
        .get_one::<String>("VMCOREINFO")
        .ok_or("missing VMCOREINFO path")?;
    let info = VmCoreInfo::parse(&std::fs::read_to_string(path)?);

    if let Some(release) = info.os_release() {
        info!("kernel release {}", release);
    }

    let src = LayoutSource::new(&NoSymbols, KERNEL_MODULE, Some(&info));

    match src.printk()? {
        PrintkLayout::Legacy(layout) => println!("legacy printk log: {:#x?}", layout),
        PrintkLayout::Modern(layout) => println!("printk ring buffer: {:#x?}", layout),
    }

    match src.per_cpu() {
        Ok(layout) => println!("per-cpu: {:#x?}", layout),
        Err(e) => println!("per-cpu: {}", e),
    }

    Ok(())
}
