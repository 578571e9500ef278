//! GRUB configuration templates
//!
//! A template is plain `grub.cfg` text with `${name}` placeholders. `$$`
//! stands for a literal `$`; any other `$` is passed through untouched so
//! GRUB's own variables (`$root`, `$gfxmode`) can be written as usual.
//! Rendering is a pure function of the template and a substitution map.

use crate::utils::error::TemplateError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$\{").expect("placeholder pattern is valid")
});

/// Values substituted into a template
pub type Substitutions = HashMap<&'static str, String>;

/// Boot parameters for the failsafe menu entry
pub const FAILSAFE_OPTIONS: &str = "ide=nodma apm=off noresume edd=off \
    powersaved=off nohz=off highres=off processor.max_cstate=1 nomodeset x11failsafe";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateId {
    Disk,
    DiskMultiboot,
    Install,
    InstallMultiboot,
}

impl TemplateId {
    pub fn select(install: bool, multiboot: bool) -> Self {
        match (install, multiboot) {
            (false, false) => Self::Disk,
            (false, true) => Self::DiskMultiboot,
            (true, false) => Self::Install,
            (true, true) => Self::InstallMultiboot,
        }
    }

    pub fn is_multiboot(&self) -> bool {
        matches!(self, Self::DiskMultiboot | Self::InstallMultiboot)
    }
}

/// Shape of the generated menu
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateOptions {
    /// Add a failsafe entry
    pub failsafe: bool,
    /// Add a "boot from hard disk" entry
    pub hybrid: bool,
    pub terminal: String,
}

const GFX_HEADER: &str = r#"set btrfs_relative_path="yes"
search ${search_params}
set default=${default_boot}
set timeout=${boot_timeout}
insmod all_video
insmod gfxterm
if loadfont ($root)${bootpath}/unicode.pf2; then
    set gfxmode=auto
    terminal_input console
    terminal_output gfxterm
fi
"#;

const CONSOLE_HEADER: &str = r#"set btrfs_relative_path="yes"
search ${search_params}
set default=${default_boot}
set timeout=${boot_timeout}
terminal_input ${terminal}
terminal_output ${terminal}
"#;

const SERIAL_SETUP: &str = "serial --speed=38400 --unit=0 --word=8 --parity=no --stop=1\n";

const LINUX_ENTRY: &str = r#"menuentry "${title}" --class os {
    set gfxpayload=keep
    echo Loading kernel...
    linux ($root)${bootpath}/${kernel_file} ${boot_options}
    echo Loading initrd...
    initrd ($root)${bootpath}/${initrd_file}
}
"#;

const LINUX_FAILSAFE_ENTRY: &str = r#"menuentry "Failsafe -- ${title}" --class os {
    set gfxpayload=keep
    echo Loading kernel...
    linux ($root)${bootpath}/${kernel_file} ${boot_options} ${failsafe_boot_options}
    echo Loading initrd...
    initrd ($root)${bootpath}/${initrd_file}
}
"#;

const MULTIBOOT_ENTRY: &str = r#"menuentry "${title}" --class os {
    insmod multiboot
    echo Loading hypervisor...
    multiboot ($root)${bootpath}/${hypervisor} dummy
    echo Loading kernel...
    module ($root)${bootpath}/${kernel_file} dummy ${boot_options}
    echo Loading initrd...
    module ($root)${bootpath}/${initrd_file} dummy
}
"#;

const MULTIBOOT_FAILSAFE_ENTRY: &str = r#"menuentry "Failsafe -- ${title}" --class os {
    insmod multiboot
    echo Loading hypervisor...
    multiboot ($root)${bootpath}/${hypervisor} dummy
    echo Loading kernel...
    module ($root)${bootpath}/${kernel_file} dummy ${boot_options} ${failsafe_boot_options}
    echo Loading initrd...
    module ($root)${bootpath}/${initrd_file} dummy
}
"#;

const HARDDISK_ENTRY: &str = r#"menuentry "Boot from Hard Disk" --class os {
    exit
}
"#;

/// Assemble the template text for `id`
pub fn template_text(id: TemplateId, options: &TemplateOptions) -> String {
    let mut text = String::new();
    match options.terminal.as_str() {
        "gfxterm" => text.push_str(GFX_HEADER),
        "serial" => {
            text.push_str(SERIAL_SETUP);
            text.push_str(CONSOLE_HEADER);
        }
        _ => text.push_str(CONSOLE_HEADER),
    }

    let (entry, failsafe) = if id.is_multiboot() {
        (MULTIBOOT_ENTRY, MULTIBOOT_FAILSAFE_ENTRY)
    } else {
        (LINUX_ENTRY, LINUX_FAILSAFE_ENTRY)
    };

    if options.hybrid {
        text.push_str(HARDDISK_ENTRY);
    }
    text.push_str(entry);
    if options.failsafe {
        text.push_str(failsafe);
    }
    text
}

/// Replace every `${name}` in `template` with its value
pub fn substitute(
    template: &str,
    values: &Substitutions,
) -> std::result::Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        match (whole.as_str(), caps.get(1)) {
            ("$$", _) => out.push('$'),
            (_, Some(name)) => {
                let value = values
                    .get(name.as_str())
                    .ok_or_else(|| TemplateError::MissingKey(name.as_str().to_string()))?;
                out.push_str(value);
            }
            (_, None) => return Err(TemplateError::UnterminatedPlaceholder(whole.start())),
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Render the template selected by `id`
pub fn render(
    id: TemplateId,
    options: &TemplateOptions,
    values: &Substitutions,
) -> std::result::Result<String, TemplateError> {
    substitute(&template_text(id, options), values)
}
