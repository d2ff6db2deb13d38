use noisepipe_core::DeviceChannel;

pub fn run() {
    let devices = DeviceChannel::discover();
    if devices.is_empty() {
        println!("No entropy devices found.");
        return;
    }
    println!("{} device(s):", devices.len());
    for (index, path) in devices.iter().enumerate() {
        println!("  [{index}] {}", path.display());
    }
}
