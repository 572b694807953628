// kernel/src/kernel/state_ref.rs
//
// extern "C" の割り込み入口（isr80h_entry / keyboard_entry）から KernelState を引くための登録先。
// - KernelState はジェネリックなので、アドレスと一緒に TypeId を覚えておく。
//   登録時と違う型で引こうとしたら None。
// - 所有は entry::start() のスタック上のまま。ここはポインタを預かるだけ。
// - 単一コア前提。割り込み中の短い処理からだけ使う。

use core::any::TypeId;

use spin::Mutex;

#[derive(Clone, Copy)]
struct Registered {
    addr: usize,
    ty: TypeId,
}

static KERNEL_STATE: Mutex<Option<Registered>> = Mutex::new(None);

/// KernelState の参照を登録する（entry.rs から呼ぶ）
///
/// # Safety
/// - ks は unregister_kernel_state() が呼ばれるまで動かさず、破棄しないこと。
/// - 登録中は with_kernel_state() 以外から ks を触らないこと。
pub unsafe fn register_kernel_state<K: 'static>(ks: &mut K) {
    *KERNEL_STATE.lock() = Some(Registered {
        addr: ks as *mut K as usize,
        ty: TypeId::of::<K>(),
    });
}

pub fn unregister_kernel_state() {
    *KERNEL_STATE.lock() = None;
}

/// KernelState を一時的に借用して処理する（割り込み入口はこれだけ使う）
///
/// f が戻らない（ring3 に入る）こともあるので、ロックは f を呼ぶ前に外す。
pub fn with_kernel_state<K: 'static, T>(f: impl FnOnce(&mut K) -> T) -> Option<T> {
    let reg = (*KERNEL_STATE.lock())?;
    if reg.ty != TypeId::of::<K>() {
        return None;
    }

    let p = reg.addr as *mut K;

    // Safety:
    // - register_kernel_state() の契約により、登録中は p が有効
    // - 型は TypeId で確認済み
    Some(unsafe { f(&mut *p) })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(u32);

    #[test]
    fn registered_state_is_reachable_only_with_matching_type() {
        let mut c = Counter(1);
        unsafe { register_kernel_state(&mut c) };

        assert_eq!(with_kernel_state(|k: &mut Counter| { k.0 += 1; k.0 }), Some(2));
        assert_eq!(with_kernel_state(|_: &mut u64| ()), None);

        unregister_kernel_state();
        assert_eq!(with_kernel_state(|k: &mut Counter| k.0), None);
        assert_eq!(c.0, 2);
    }
}
