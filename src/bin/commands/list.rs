use evmqtt::device;

pub fn list() {
    let list = device::register(device::enumerate(), false);

    if list.is_empty() {
        eprintln!("error: no input devices found");
        std::process::exit(1);
    }

    println!("Found {} input device(s):", list.len());

    for dev in list {
        println!("{}:", dev.path);
        println!("\tName\t\t: {}", dev.name);
        println!("\tSlug\t\t: {}", dev.slug);
        println!("\tEvents\t\t: {}", dev.capabilities);
    }
}
