fn main() {
    std::process::exit(bub::run::run());
}
