#![no_main]

use cpulimit::procfs::parse_stat;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // /proc/<pid>/stat is read with read_to_string, so only UTF-8 reaches the parser
    if let Ok(input) = std::str::from_utf8(data) {
        if let Ok(stat) = parse_stat(input) {
            // a parsed line always has a well-formed comm slice
            assert!(input.contains(&format!("({})", stat.comm)));
        }
    }
});
