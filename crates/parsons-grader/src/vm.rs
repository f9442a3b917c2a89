//! RustPython glue for one execution unit.
//!
//! Owns every RustPython API call:
//! - builds a fresh interpreter with native stdlib modules and the frozen
//!   RustPython library
//! - delivers interrupts through the interpreter's user signal channel
//! - registers a real `__main__` module so `doctest.testmod()` finds the
//!   learner's definitions
//! - gates imports from `__main__` against the allowlist
//! - compiles with the `<exec>` filename and renders compile errors as a
//!   Python-style traceback, so the interpreter can remap their line numbers
//! - turns the `__result__` binding into the reply's `results`

use std::collections::HashSet;
use std::sync::Arc;

use rustpython_vm::{
    builtins::{PyBaseExceptionRef, PyStr},
    compiler::{CompileError, Mode},
    function::FuncArgs,
    scope::Scope,
    signal::{UserSignalReceiver, UserSignalSender},
    AsObject, Interpreter, PyObjectRef, PyResult, VirtualMachine,
};

use crate::modules::is_module_allowed;
use crate::output::OutputBuffer;
use crate::types::UnitReply;

/// Filename the learner's script is compiled under.
pub(crate) const EXEC_FILENAME: &str = "<exec>";

/// Name the last expression is bound to before compilation.
pub(crate) const RESULT_BINDING: &str = "__result__";

const INTERRUPT_MESSAGE: &str = "execution unit terminated";

/// A fresh interpreter bound to one allowlist. Never reused across units.
pub(crate) struct GuestInterpreter {
    inner: Interpreter,
    allowed_set: Arc<HashSet<String>>,
}

/// Build an interpreter with the frozen RustPython library and the native
/// stdlib modules. Signals sent on `interrupts`' sender run between bytecode
/// instructions.
pub(crate) fn build_interpreter(
    allowed_set: Arc<HashSet<String>>,
    interrupts: UserSignalReceiver,
) -> GuestInterpreter {
    let inner = Interpreter::with_init(rustpython_vm::Settings::default(), |vm| {
        vm.add_native_modules(rustpython_stdlib::get_module_inits());
        vm.add_frozen(rustpython_pylib::FROZEN_STDLIB);
        vm.set_user_signal_channel(interrupts);
    });

    GuestInterpreter { inner, allowed_set }
}

/// Ask the interpreter behind `tx` to raise `KeyboardInterrupt` at its next
/// instruction. Returns `false` once the interpreter is gone.
///
/// `KeyboardInterrupt` is the one exception doctest re-raises instead of
/// recording as a failed example.
pub(crate) fn request_interrupt(tx: &UserSignalSender) -> bool {
    tx.send(Box::new(|vm: &VirtualMachine| -> PyResult<()> {
        Err(vm.new_exception_msg(
            vm.ctx.exceptions.keyboard_interrupt.to_owned(),
            INTERRUPT_MESSAGE.to_owned(),
        ))
    }))
    .is_ok()
}

/// Run `source` to completion and package the result as a unit reply.
pub(crate) fn run_source(interp: &GuestInterpreter, source: &str, output: OutputBuffer) -> UnitReply {
    interp.inner.enter(|vm| {
        // `builtins.__import__` only exists after initialization, so the hook
        // goes in here rather than in `with_init`.
        install_import_hook(vm, Arc::clone(&interp.allowed_set));
        install_output_capture(vm, output.clone());

        let code = match vm.compile(source, Mode::Exec, EXEC_FILENAME.to_owned()) {
            Ok(code) => code,
            Err(err) => return UnitReply::error(compile_error_traceback(&err, source)),
        };

        let scope = match main_scope(vm) {
            Ok(scope) => scope,
            Err(exc) => return UnitReply::error(exception_traceback(vm, &exc)),
        };

        if let Err(exc) = vm.run_code_obj(code, scope.clone()) {
            return UnitReply::error(exception_traceback(vm, &exc));
        }

        if output.is_limit_exceeded() {
            return UnitReply::error(format!("Output limit exceeded: {} bytes", output.limit()));
        }

        match last_value(vm, &scope) {
            Some(value) => UnitReply::results(value),
            None => UnitReply::results(output.into_strings().0),
        }
    })
}

/// A builtins scope whose globals double as `sys.modules['__main__']`.
fn main_scope(vm: &VirtualMachine) -> PyResult<Scope> {
    let scope = vm.new_scope_with_builtins();
    scope
        .globals
        .set_item("__name__", vm.ctx.new_str("__main__").into(), vm)?;
    let main_module = vm.new_module("__main__", scope.globals.clone(), None);
    vm.sys_module
        .get_attr("modules", vm)?
        .set_item("__main__", main_module.into(), vm)?;
    Ok(scope)
}

/// Imports are gated only when the importer's globals say `__main__`; that
/// covers the learner's code and the doctest examples, which run on a copy
/// of the module globals. Stdlib internals import freely.
fn is_main_import(args: &FuncArgs, vm: &VirtualMachine) -> bool {
    let Some(globals) = args.args.get(1) else {
        return true;
    };
    if vm.is_none(globals) {
        return true;
    }
    vm.call_method(globals, "get", (vm.ctx.new_str("__name__"),))
        .ok()
        .filter(|name| !vm.is_none(name))
        .and_then(|name| name.str(vm).ok())
        .map(|name| name.as_str() == "__main__")
        .unwrap_or(true)
}

/// Replace `builtins.__import__` with an allowlist check that delegates to
/// the original import on success.
fn install_import_hook(vm: &VirtualMachine, allowed_set: Arc<HashSet<String>>) {
    let Ok(original_import) = vm.builtins.get_attr("__import__", vm) else {
        return;
    };

    let hook = vm.new_function(
        "__import__",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let module_name = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();

            // Relative imports (level > 0) only happen inside packages.
            let level = args
                .args
                .get(4)
                .and_then(|o| {
                    use rustpython_vm::TryFromObject;
                    i64::try_from_object(vm, o.clone()).ok()
                })
                .unwrap_or(0);

            if level == 0
                && is_main_import(&args, vm)
                && !is_module_allowed(&module_name, &allowed_set)
            {
                return Err(vm.new_import_error(
                    format!("import of '{module_name}' is not allowed"),
                    vm.ctx.new_str(module_name),
                ));
            }

            original_import.call(args, vm)
        },
    );

    let _ = vm.builtins.set_attr("__import__", hook, vm);
}

/// Point `sys.stdout` / `sys.stderr` at the unit's [`OutputBuffer`].
fn install_output_capture(vm: &VirtualMachine, output: OutputBuffer) {
    let stdout_obj = build_writer_object(vm, output.clone(), true);
    let stderr_obj = build_writer_object(vm, output, false);
    let _ = vm.sys_module.set_attr("stdout", stdout_obj, vm);
    let _ = vm.sys_module.set_attr("stderr", stderr_obj, vm);
}

/// Minimal file-like namespace with `write`, `flush`, `closed`, `encoding`.
fn build_writer_object(vm: &VirtualMachine, output: OutputBuffer, is_stdout: bool) -> PyObjectRef {
    let write_fn = vm.new_function(
        "write",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let data = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();

            let written = if is_stdout {
                output.write_stdout(data.as_bytes())
            } else {
                output.write_stderr(data.as_bytes())
            };
            match written {
                Ok(()) => Ok(vm.ctx.new_int(data.len()).into()),
                Err(limit) => Err(vm.new_runtime_error(limit.to_string())),
            }
        },
    );

    let flush_fn = vm.new_function(
        "flush",
        |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> { Ok(vm.ctx.none()) },
    );

    let ns = vm.new_module("<writer>", vm.ctx.new_dict(), None);
    let _ = ns.set_attr("write", write_fn, vm);
    let _ = ns.set_attr("flush", flush_fn, vm);
    let _ = ns.set_attr("closed", vm.ctx.new_bool(false), vm);
    let _ = ns.set_attr("encoding", vm.ctx.new_str("utf-8"), vm);
    ns.into()
}

/// Render a compile error the way CPython prints an uncaught `SyntaxError`.
fn compile_error_traceback(err: &CompileError, source: &str) -> String {
    let (row, col) = err.python_location();
    let (row, col) = (row as usize, col as usize);
    let message = err.to_string();
    let class = error_class(&message);

    let mut text = format!("Traceback (most recent call last):\n  File \"{EXEC_FILENAME}\", line {row}\n");
    if let Some(src) = source.lines().nth(row.saturating_sub(1)) {
        let indent = src.len() - src.trim_start().len();
        let caret = col.saturating_sub(1).saturating_sub(indent);
        text.push_str(&format!("    {}\n    {}^\n", src.trim(), " ".repeat(caret)));
    }
    text.push_str(&format!("{class}: {message}"));
    text
}

/// RustPython reports indentation problems as ordinary parse errors.
fn error_class(message: &str) -> &'static str {
    if message.to_lowercase().contains("indent") {
        "IndentationError"
    } else {
        "SyntaxError"
    }
}

fn exception_traceback(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> String {
    let mut text = String::new();
    if vm.write_exception(&mut text, exc).is_err() || text.is_empty() {
        text = exc
            .as_object()
            .str(vm)
            .map(|s| s.as_str().to_owned())
            .unwrap_or_else(|_| "Unknown runtime error".to_owned());
    }
    text
}

/// The value bound to `__result__`: strings verbatim, anything else as `repr`.
fn last_value(vm: &VirtualMachine, scope: &Scope) -> Option<String> {
    let locals: PyObjectRef = scope.locals.as_ref().to_owned();
    let value = vm
        .call_method(&locals, "get", (vm.ctx.new_str(RESULT_BINDING),))
        .ok()?;
    if vm.is_none(&value) {
        return None;
    }
    if let Some(s) = value.payload::<PyStr>() {
        return Some(s.as_str().to_owned());
    }
    value.repr(vm).ok().map(|s| s.as_str().to_owned())
}
