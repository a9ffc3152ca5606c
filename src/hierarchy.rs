//! The containment hierarchy: machine → linac → cryomodule → rack → cavity.
//!
//! Container nodes are created once at startup from [`Settings`] and live for
//! the process lifetime; every cavity belongs to exactly one rack, one
//! cryomodule, one linac, and one machine. Containment and abortability are
//! two orthogonal capabilities composed on each node: containers own their
//! children and forward commands downward, leaves carry the
//! [`AbortState`](crate::abort::AbortState) and the procedures.
//!
//! Construction is explicit and fallible: every channel binding for every
//! node is established here, so a connection problem surfaces as a build
//! error rather than a deferred check at first access.

use crate::cavity::Cavity;
use crate::channel::ChannelAccess;
use crate::config::Settings;
use crate::error::{SetupError, SetupResult};
use crate::persist::PositionStore;
use crate::status::StatusSink;
use std::collections::HashSet;
use std::sync::Arc;

/// Cavity numbers served by each rack.
const RACK_A_CAVITIES: [u8; 4] = [1, 2, 3, 4];
const RACK_B_CAVITIES: [u8; 4] = [5, 6, 7, 8];

/// One half-cryomodule RF rack and its four cavities.
pub struct Rack {
    name: char,
    cavities: Vec<Arc<Cavity>>,
}

impl Rack {
    #[allow(clippy::too_many_arguments)]
    fn build(
        name: char,
        cavity_numbers: &[u8],
        linac_name: &str,
        cm_name: &str,
        harmonic_linearizer: bool,
        service: &Arc<dyn ChannelAccess>,
        sink: &Arc<dyn StatusSink>,
        store: &Arc<PositionStore>,
        settings: &Settings,
    ) -> SetupResult<Self> {
        let rack_prefix = format!("ACCL:{linac_name}:{cm_name}00:RACK{name}:");
        let mut cavities = Vec::with_capacity(cavity_numbers.len());
        for &number in cavity_numbers {
            cavities.push(Cavity::new(
                linac_name,
                cm_name,
                number,
                harmonic_linearizer,
                &rack_prefix,
                Arc::clone(service),
                Arc::clone(sink),
                Arc::clone(store),
                settings,
            )?);
        }
        Ok(Self { name, cavities })
    }

    /// Rack designation, `A` or `B`.
    pub fn name(&self) -> char {
        self.name
    }

    /// This rack's cavities.
    pub fn cavities(&self) -> &[Arc<Cavity>] {
        &self.cavities
    }
}

/// A cryomodule: eight cavities split over two racks.
pub struct Cryomodule {
    name: String,
    linac_name: String,
    harmonic_linearizer: bool,
    racks: Vec<Rack>,
}

impl Cryomodule {
    fn build(
        name: &str,
        linac_name: &str,
        service: &Arc<dyn ChannelAccess>,
        sink: &Arc<dyn StatusSink>,
        store: &Arc<PositionStore>,
        settings: &Settings,
    ) -> SetupResult<Self> {
        // Harmonic linearizers are named H1/H2 and tune backwards.
        let harmonic_linearizer = name.starts_with('H');
        let racks = vec![
            Rack::build(
                'A',
                &RACK_A_CAVITIES,
                linac_name,
                name,
                harmonic_linearizer,
                service,
                sink,
                store,
                settings,
            )?,
            Rack::build(
                'B',
                &RACK_B_CAVITIES,
                linac_name,
                name,
                harmonic_linearizer,
                service,
                sink,
                store,
                settings,
            )?,
        ];
        Ok(Self {
            name: name.to_string(),
            linac_name: linac_name.to_string(),
            harmonic_linearizer,
            racks,
        })
    }

    /// Short name, e.g. "01" or "H1".
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Operator-facing label, e.g. "CM01".
    pub fn label(&self) -> String {
        format!("CM{}", self.name)
    }

    /// Linac section this cryomodule sits in.
    pub fn linac_name(&self) -> &str {
        &self.linac_name
    }

    /// Whether this is a harmonic-linearizer cryomodule.
    pub fn is_harmonic_linearizer(&self) -> bool {
        self.harmonic_linearizer
    }

    /// The two RF racks.
    pub fn racks(&self) -> &[Rack] {
        &self.racks
    }

    /// Delegate to the racks; depth is handled by composition.
    pub fn collect_cavities<'a>(&'a self, out: &mut Vec<&'a Arc<Cavity>>) {
        for rack in &self.racks {
            out.extend(rack.cavities());
        }
    }
}

/// One linac section, a container of cryomodules.
pub struct Linac {
    name: String,
    cryomodules: Vec<Cryomodule>,
}

impl Linac {
    /// Section name, e.g. "L1B".
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cryomodules in this section.
    pub fn cryomodules(&self) -> &[Cryomodule] {
        &self.cryomodules
    }

    /// Delegate to the cryomodules, filtering excluded ones.
    pub fn collect_cavities<'a>(
        &'a self,
        exclusions: &HashSet<String>,
        out: &mut Vec<&'a Arc<Cavity>>,
    ) {
        for cm in &self.cryomodules {
            if excluded(cm, exclusions) {
                continue;
            }
            cm.collect_cavities(out);
        }
    }
}

fn excluded(cm: &Cryomodule, exclusions: &HashSet<String>) -> bool {
    exclusions.contains(cm.name()) || exclusions.contains(&cm.label())
}

/// The whole accelerator: a container of linacs, constructed exactly once.
pub struct Machine {
    linacs: Vec<Linac>,
}

impl Machine {
    /// Build the full hierarchy from `settings`, binding every channel of
    /// every node. Any failure aborts the build.
    pub fn build(
        settings: &Settings,
        service: Arc<dyn ChannelAccess>,
        sink: Arc<dyn StatusSink>,
        store: Arc<PositionStore>,
    ) -> SetupResult<Self> {
        let mut linacs = Vec::with_capacity(settings.machine.linacs.len());
        for linac_layout in &settings.machine.linacs {
            let mut cryomodules = Vec::with_capacity(linac_layout.cryomodules.len());
            for cm_name in &linac_layout.cryomodules {
                cryomodules.push(Cryomodule::build(
                    cm_name,
                    &linac_layout.name,
                    &service,
                    &sink,
                    &store,
                    settings,
                )?);
            }
            linacs.push(Linac {
                name: linac_layout.name.clone(),
                cryomodules,
            });
        }
        Ok(Self { linacs })
    }

    /// Linac sections in beamline order.
    pub fn linacs(&self) -> &[Linac] {
        &self.linacs
    }

    /// Find a cryomodule by short name ("01") or label ("CM01").
    pub fn cryomodule(&self, name: &str) -> Option<&Cryomodule> {
        self.linacs.iter().flat_map(|l| l.cryomodules()).find(|cm| {
            cm.name().eq_ignore_ascii_case(name)
                || cm.label().eq_ignore_ascii_case(name)
        })
    }

    /// Delegate to the linacs.
    pub fn collect_cavities<'a>(
        &'a self,
        exclusions: &HashSet<String>,
        out: &mut Vec<&'a Arc<Cavity>>,
    ) {
        for linac in &self.linacs {
            linac.collect_cavities(exclusions, out);
        }
    }

    /// Resolve a command target to the cavities under it.
    ///
    /// Accepted forms: `machine`, a linac name (`L0B`), a cryomodule
    /// (`CM01`, `01`, `H1`), a rack (`CM01:A`), or a cavity (`CM01:3`).
    /// Excluded cryomodules are filtered out of machine and linac scopes;
    /// leaves outside the resolved scope are left entirely untouched.
    pub fn resolve(
        &self,
        target: &str,
        exclusions: &HashSet<String>,
    ) -> SetupResult<Vec<Arc<Cavity>>> {
        let mut found: Vec<&Arc<Cavity>> = Vec::new();

        if target.eq_ignore_ascii_case("machine") {
            self.collect_cavities(exclusions, &mut found);
        } else if let Some(linac) = self
            .linacs
            .iter()
            .find(|l| l.name().eq_ignore_ascii_case(target))
        {
            linac.collect_cavities(exclusions, &mut found);
        } else if let Some((cm_name, member)) = target.split_once(':') {
            let cm = self.cryomodule(cm_name).ok_or_else(|| {
                SetupError::Configuration(format!("unknown cryomodule in target '{target}'"))
            })?;
            if let Ok(number) = member.parse::<u8>() {
                let cavity = cm
                    .racks()
                    .iter()
                    .flat_map(|r| r.cavities())
                    .find(|c| c.number() == number)
                    .ok_or_else(|| {
                        SetupError::Configuration(format!(
                            "no cavity {number} in {}",
                            cm.label()
                        ))
                    })?;
                found.push(cavity);
            } else {
                let rack_name = member.chars().next().unwrap_or(' ').to_ascii_uppercase();
                let rack = cm
                    .racks()
                    .iter()
                    .find(|r| r.name() == rack_name)
                    .ok_or_else(|| {
                        SetupError::Configuration(format!(
                            "no rack '{member}' in {}",
                            cm.label()
                        ))
                    })?;
                found.extend(rack.cavities());
            }
        } else if let Some(cm) = self.cryomodule(target) {
            cm.collect_cavities(&mut found);
        } else {
            return Err(SetupError::Configuration(format!(
                "cannot resolve target '{target}'"
            )));
        }

        if found.is_empty() {
            return Err(SetupError::Configuration(format!(
                "target '{target}' matches no cavities (all excluded?)"
            )));
        }
        Ok(found.into_iter().cloned().collect())
    }
}
