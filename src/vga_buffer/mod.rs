//! VGA buffer management module.
//! It provides a safe interface to write to the VGA text buffer.

#![allow(unused_imports, reason = "Imports are used in test cases.")]
use crate::arch;
use core::fmt::Write;
use writer::WRITER;

mod buffer;
mod colors;
mod constants;
#[macro_use]
pub mod macros;
mod writer;

/// Write a single byte at the current cursor position, advancing it.
/// Shared entry point for both kernel logging (`print!`) and terminal echo.
pub fn write_byte(byte: u8) {
    arch::without_interrupts(|| {
        WRITER.lock().write_byte(byte);
    });
}

/// Move the cursor to `(x, y)` without touching buffer contents.
pub fn set_cursor(x: usize, y: usize) {
    arch::without_interrupts(|| {
        WRITER.lock().set_cursor(x, y);
    });
}

/// Blank the screen and return the cursor to the origin.
pub fn clear_screen() {
    arch::without_interrupts(|| {
        WRITER.lock().clear_screen();
    });
}

/// Test that printing many lines will not panic.
#[test_case]
fn test_when_printing_many_lines_should_not_panic() {
    for _ in 0..200 {
        println!("test many print output.");
    }
}

/// Test that a line a line will be printed on the screen.
/// # Panics
/// Fail if the line is not printed on the screen.
#[test_case]
fn test_when_printing_a_line_should_appear_in_vga_buffer() {
    let line = "Some line that fits on a single line";

    arch::without_interrupts(|| {
        let mut writer = WRITER.lock();

        #[expect(
            clippy::uninlined_format_args,
            reason = "This is a test, we want to use format_args!"
        )]
        writeln!(writer, "\n{}", line).expect("Failed to write line to vga buffer.");
        for (i, c) in line.chars().enumerate() {
            let screen_char = writer.buffer.chars[constants::BUFFER_HEIGHT - 2][i].read();
            assert_eq!(
                char::from(screen_char.ascii_character),
                c,
                "Character mismatch at position {i}.",
            );
        }
    });
}
