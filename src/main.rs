fn main() {
    if keywarp::lib_main::run().is_err() {
        std::process::exit(1);
    }
}
