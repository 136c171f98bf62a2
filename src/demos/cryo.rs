// -----------------------------------------------------------------------------
// Rust SECoP playground
//
// This program is free software; you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation; either version 2 of the License, or (at your option) any later
// version.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program; if not, write to the Free Software Foundation, Inc.,
// 59 Temple Place, Suite 330, Boston, MA 02111-1307 USA
//
// Module authors:
// Georg Brandl <g.brandl@fz-juelich.de>
//
// -----------------------------------------------------------------------------
//
//! Demo cryostat module: a simulated regulated-temperature device, ported
//! (in spirit, not in physics) from the `play::cryo` simulator.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::info;
use mlzutil::time::localtime;
use parking_lot::Mutex;
use serde_json::json;

use secop_core::backend::BackendOutcome;
use secop_core::errors::Error;
use secop_core::registry::Registry;
use secop_core::variant::{DoubleInfo, EnumInfo, StringInfo, Variant};

#[derive(Clone, Copy)]
struct StateVars {
    regulation: f64,
    target: f64,
    ramp: f64,
    heater: f64,
    moving: bool,
}

fn clamp(v: f64, min: f64, max: f64) -> f64 {
    v.max(min).min(max)
}

fn simulate(vars: Arc<Mutex<StateVars>>) {
    mlzlog::set_thread_prefix("[CryoSim] ".into());
    loop {
        thread::sleep(Duration::from_millis(500));
        let mut v = vars.lock();
        let step = if v.ramp > 0.0 { v.ramp * 0.5 } else { f64::INFINITY };
        let delta = v.target - v.regulation;
        v.moving = delta.abs() > 0.01;
        v.regulation += clamp(delta, -step, step);
        v.heater = clamp(delta.abs() * 10.0, 0.0, 100.0);
        info!("regulation = {:.3}, target = {:.3}, heater = {:.1}", v.regulation, v.target, v.heater);
    }
}

fn double_info(min: f64, max: f64, unit: &str) -> DoubleInfo {
    DoubleInfo { min: Some(min), max: Some(max), unit: Some(unit.to_owned()), ..Variant::double() }
}

fn status_members() -> Vec<(String, i64)> {
    vec![("idle".into(), 100), ("busy".into(), 300)]
}

fn status_shape() -> Variant {
    Variant::Tuple(vec![
            Variant::Enum(EnumInfo { value: 100, members: status_members() }),
            Variant::Str(StringInfo { value: String::new(), min_chars: 0, max_chars: 255, is_utf8: true }),
    ])
}

/// Register the `T` module on whichever node is currently the Registry's
/// add-focus.
pub fn install() -> Result<(), Error> {
    Registry::add_module("T")?;
    Registry::add_property("description", json!("regulated sample temperature"))?;
    Registry::add_property("interface_class", json!(["readable", "writable", "drivable"]))?;

    let module = Registry::module("cryo", "T")?;

    let vars = Arc::new(Mutex::new(StateVars {
                regulation: 3.0, target: 3.0, ramp: 1.0, heater: 0.0, moving: false,
    }));
    let sim_vars = Arc::clone(&vars);
    thread::spawn(move || simulate(sim_vars));

    let value_shape = double_info(0.0, 500.0, "K");
    let target_shape = double_info(0.0, 500.0, "K");
    let ramp_shape = double_info(0.0, 100.0, "K/min");

    {
        let vars = Arc::clone(&vars);
        let shape = value_shape.clone();
        module.add_readable_parameter("value", Variant::Double(value_shape.clone()),
            Box::new(move |_| {
                    let v = vars.lock();
                    BackendOutcome::Ready(Ok((
                                Variant::Double(DoubleInfo { value: v.regulation, ..shape.clone() }),
                                None, localtime(),
                    )))
        }));
    }

    {
        let vars = Arc::clone(&vars);
        module.add_readable_parameter("status", status_shape(),
            Box::new(move |_| {
                    let v = vars.lock();
                    let (code, text): (i64, &str) = if v.moving { (300, "ramping") } else { (100, "") };
                    BackendOutcome::Ready(Ok((
                                Variant::Tuple(vec![
                                        Variant::Enum(EnumInfo { value: code, members: status_members() }),
                                        Variant::Str(StringInfo { value: text.to_owned(), min_chars: 0, max_chars: 255, is_utf8: true }),
                                ]),
                                None, localtime(),
                    )))
        }));
    }

    {
        let getter_vars = Arc::clone(&vars);
        let setter_vars = Arc::clone(&vars);
        let getter_shape = target_shape.clone();
        let setter_shape = target_shape.clone();
        module.add_writable_parameter("target", Variant::Double(target_shape.clone()),
            Box::new(move |_| {
                    let v = getter_vars.lock();
                    BackendOutcome::Ready(Ok((
                                Variant::Double(DoubleInfo { value: v.target, ..getter_shape.clone() }), None, localtime(),
                    )))
            }),
            Box::new(move |_, value| {
                    let target = match value {
                        Variant::Double(d) => d.value,
                        _ => return BackendOutcome::Ready(Err(Error::bad_value("expected double"))),
                    };
                    let mut v = setter_vars.lock();
                    v.target = target;
                    BackendOutcome::Ready(Ok((
                                Variant::Double(DoubleInfo { value: target, ..setter_shape.clone() }), None, localtime(),
                    )))
        }));
    }

    {
        let getter_vars = Arc::clone(&vars);
        let setter_vars = Arc::clone(&vars);
        let getter_shape = ramp_shape.clone();
        let setter_shape = ramp_shape.clone();
        module.add_writable_parameter("ramp", Variant::Double(ramp_shape.clone()),
            Box::new(move |_| {
                    let v = getter_vars.lock();
                    BackendOutcome::Ready(Ok((
                                Variant::Double(DoubleInfo { value: v.ramp, ..getter_shape.clone() }), None, localtime(),
                    )))
            }),
            Box::new(move |_, value| {
                    let ramp = match value {
                        Variant::Double(d) => d.value,
                        _ => return BackendOutcome::Ready(Err(Error::bad_value("expected double"))),
                    };
                    let mut v = setter_vars.lock();
                    v.ramp = ramp;
                    BackendOutcome::Ready(Ok((
                                Variant::Double(DoubleInfo { value: ramp, ..setter_shape.clone() }), None, localtime(),
                    )))
        }));
    }

    {
        let vars = Arc::clone(&vars);
        module.add_command("stop", Variant::Null, Variant::Null,
            Box::new(move |_, _| {
                    let mut v = vars.lock();
                    v.target = v.regulation;
                    BackendOutcome::Ready(Ok((Variant::Null, localtime())))
        }));
    }

    module.add_accessible_property("value", "description", json!("regulated temperature")).ok();
    module.add_accessible_property("status", "description", json!("module status")).ok();
    module.add_accessible_property("target", "description", json!("setpoint temperature")).ok();
    module.add_accessible_property("ramp", "description", json!("ramp rate, 0 for unlimited")).ok();
    module.add_accessible_property("stop", "description", json!("stop ramping at the current value")).ok();

    Ok(())
}
