//! The command language over stdin/stdout, without a network.

use std::io::{BufRead, Write};

use crate::core::{CommandService, Session};
use crate::error::Result;

/// Read commands from `input` until EOF, writing each response to `output`.
pub fn run<R: BufRead, W: Write>(service: CommandService, input: R, mut output: W) -> Result<()> {
    let mut session = Session::new(service);

    for line in input.lines() {
        if let Some(response) = session.handle_line(&line?) {
            response.write_to(&mut output)?;
            output.flush()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_a_script() {
        let script = "Newgraph 3\n0,0\n4,0\n0,3\nCH\nNewpoint 4,3\nCH\nRemovepoint 9,9\nfoo\n";
        let mut out = Vec::new();

        run(CommandService::default(), script.as_bytes(), &mut out).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Ready to receive 3 points. Send them as x,y format:\n\
             Graph created with 3 points\n\
             6.000000\n\
             Point added\n\
             12.000000\n\
             Point not found\n\
             ERROR: Unknown command\n"
        );
    }
}
