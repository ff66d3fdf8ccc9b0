#![no_main]

use libfuzzer_sys::fuzz_target;

// Input layout: 13 header bytes configuring the page heap, then 9-byte
// operation frames. Any accounting violation aborts.
fuzz_target!(|data: &[u8]| {
    pageheap_exerciser::fuzz_one_input(data);
});
