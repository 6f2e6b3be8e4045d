fn main() {
    std::process::exit(ta612c_bridge_lib::run())
}
