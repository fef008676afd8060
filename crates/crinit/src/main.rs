fn main() {
    libcrinit::entrypoints::run_init();
}
