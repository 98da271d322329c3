//! Helpers shared by the integration tests.

use std::sync::Once;

use bcemit::{Ast, EmitLimits, Opcode, Script, compile_script};
use tracing_subscriber::EnvFilter;

/// Installs a test-friendly subscriber once; `RUST_LOG=bcemit=debug` shows
/// the widening pass at work.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Compiles `ast` as a script with default limits.
pub fn compile(ast: &Ast) -> Script {
    init_test_logging();
    compile_script(ast, "test.js", EmitLimits::default()).expect("script should compile")
}

/// Opcodes of `script` in order.
pub fn ops(script: &Script) -> Vec<Opcode> {
    script.instructions().map(|insn| insn.op).collect()
}
